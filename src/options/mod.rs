//! Typed configuration options.
//!
//! An [`Opt`] is a single named configuration value with a declared
//! [`TypeSpec`], a default, a current value, an is-set flag, help text and
//! optional enumerated choices. Values are dynamically typed
//! (`serde_json::Value`) and checked against the declared spec on *every*
//! write, not only at registration.

use serde_json::Value;

use crate::error::{KestrelError, Result};

mod config;
mod manager;

pub use config::{flatten, load, load_paths, parse};
pub use manager::{Namespace, NamespaceMut, OptManager, Subscription};

// ---------------------------------------------------------------------------
// Type specifications
// ---------------------------------------------------------------------------

/// The declared type of an option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSpec {
    /// A string.
    Str,
    /// A signed integer. Floats are rejected.
    Int,
    /// A boolean.
    Bool,
    /// A float. Integer values are accepted.
    Float,
    /// The wrapped type, or null.
    Optional(Box<TypeSpec>),
    /// A fixed-arity ordered collection with per-slot types.
    Tuple(Vec<TypeSpec>),
    /// A sequence of strings.
    Seq,
    /// Anything goes.
    Any,
}

impl std::fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeSpec::Str => f.write_str("str"),
            TypeSpec::Int => f.write_str("int"),
            TypeSpec::Bool => f.write_str("bool"),
            TypeSpec::Float => f.write_str("float"),
            TypeSpec::Optional(inner) => write!(f, "optional<{}>", inner),
            TypeSpec::Tuple(slots) => {
                f.write_str("(")?;
                for (i, slot) in slots.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", slot)?;
                }
                f.write_str(")")
            }
            TypeSpec::Seq => f.write_str("[str]"),
            TypeSpec::Any => f.write_str("any"),
        }
    }
}

/// A short label for a value's runtime shape, used in type errors.
fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Check that `value` conforms to `typespec`, failing with a `Config` error
/// naming `name` when it does not.
///
/// Optional types accept null or the wrapped type. Tuple types require a
/// fixed-length array with per-slot conformance; slot failures are reported
/// as `name[i]`. An integer value satisfies a float-typed option; the
/// reverse does not hold.
pub fn assert_type(name: &str, value: &Value, typespec: &TypeSpec) -> Result<()> {
    let mismatch = || {
        KestrelError::Config(format!(
            "Expected {} for {}, but got {}",
            typespec,
            name,
            value_kind(value)
        ))
    };

    match typespec {
        TypeSpec::Any => Ok(()),
        TypeSpec::Str => match value {
            Value::String(_) => Ok(()),
            _ => Err(mismatch()),
        },
        TypeSpec::Bool => match value {
            Value::Bool(_) => Ok(()),
            _ => Err(mismatch()),
        },
        TypeSpec::Int => match value {
            Value::Number(n) if n.as_i64().is_some() || n.as_u64().is_some() => Ok(()),
            _ => Err(mismatch()),
        },
        TypeSpec::Float => match value {
            Value::Number(_) => Ok(()),
            _ => Err(mismatch()),
        },
        TypeSpec::Optional(inner) => {
            if value.is_null() {
                Ok(())
            } else {
                assert_type(name, value, inner).map_err(|_| mismatch())
            }
        }
        TypeSpec::Tuple(slots) => {
            let items = value.as_array().ok_or_else(mismatch)?;
            if items.len() != slots.len() {
                return Err(mismatch());
            }
            for (i, (item, slot)) in items.iter().zip(slots).enumerate() {
                assert_type(&format!("{}[{}]", name, i), item, slot)?;
            }
            Ok(())
        }
        TypeSpec::Seq => {
            let items = value.as_array().ok_or_else(mismatch)?;
            if items.iter().all(Value::is_string) {
                Ok(())
            } else {
                Err(mismatch())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Option
// ---------------------------------------------------------------------------

/// A single named, typed configuration value.
///
/// Created once via [`OptManager::add_option`]; never removed. `reset`
/// returns it to its default and clears the is-set flag.
#[derive(Debug, Clone)]
pub struct Opt {
    name: String,
    typespec: TypeSpec,
    default: Value,
    value: Value,
    is_set: bool,
    help: String,
    choices: Option<Vec<Value>>,
}

impl Opt {
    pub(crate) fn new(
        name: &str,
        typespec: TypeSpec,
        default: Value,
        help: &str,
        choices: Option<Vec<Value>>,
    ) -> Result<Self> {
        assert_type(name, &default, &typespec)?;
        Ok(Self {
            name: name.to_string(),
            value: default.clone(),
            typespec,
            default,
            is_set: false,
            help: help.to_string(),
            choices,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn typespec(&self) -> &TypeSpec {
        &self.typespec
    }

    /// The declared default, cloned so callers cannot alias shared state.
    pub fn default(&self) -> Value {
        self.default.clone()
    }

    /// The current value, cloned so callers cannot alias shared state.
    pub fn value(&self) -> Value {
        self.value.clone()
    }

    /// Whether the option has been explicitly set since registration or the
    /// last reset.
    pub fn is_set(&self) -> bool {
        self.is_set
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    /// Enumerated choices, if declared. Declarative metadata only; values
    /// are not validated against it.
    pub fn choices(&self) -> Option<&[Value]> {
        self.choices.as_deref()
    }

    /// Type-check and store a new value, marking the option as set.
    pub(crate) fn set_value(&mut self, value: Value) -> Result<()> {
        assert_type(&self.name, &value, &self.typespec)?;
        self.is_set = true;
        self.value = value;
        Ok(())
    }

    /// Return to the default value and clear the is-set flag.
    pub fn reset(&mut self) {
        self.is_set = false;
        self.value = self.default.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_assert_type_scalars() {
        assert!(assert_type("s", &json!("hello"), &TypeSpec::Str).is_ok());
        assert!(assert_type("s", &json!(1), &TypeSpec::Str).is_err());
        assert!(assert_type("i", &json!(42), &TypeSpec::Int).is_ok());
        assert!(assert_type("i", &json!(4.2), &TypeSpec::Int).is_err());
        assert!(assert_type("b", &json!(true), &TypeSpec::Bool).is_ok());
        assert!(assert_type("b", &json!("true"), &TypeSpec::Bool).is_err());
    }

    #[test]
    fn test_assert_type_float_accepts_int() {
        assert!(assert_type("f", &json!(1.5), &TypeSpec::Float).is_ok());
        assert!(assert_type("f", &json!(3), &TypeSpec::Float).is_ok());
        assert!(assert_type("f", &json!("3"), &TypeSpec::Float).is_err());
    }

    #[test]
    fn test_assert_type_optional() {
        let spec = TypeSpec::Optional(Box::new(TypeSpec::Int));
        assert!(assert_type("o", &Value::Null, &spec).is_ok());
        assert!(assert_type("o", &json!(7), &spec).is_ok());
        assert!(assert_type("o", &json!("7"), &spec).is_err());
    }

    #[test]
    fn test_assert_type_tuple_arity_and_slots() {
        let spec = TypeSpec::Tuple(vec![TypeSpec::Str, TypeSpec::Int]);
        assert!(assert_type("t", &json!(["a", 1]), &spec).is_ok());
        assert!(assert_type("t", &json!(["a"]), &spec).is_err());
        assert!(assert_type("t", &json!(["a", 1, 2]), &spec).is_err());
        let err = assert_type("t", &json!(["a", "b"]), &spec).unwrap_err();
        assert!(err.to_string().contains("t[1]"));
    }

    #[test]
    fn test_assert_type_seq_and_any() {
        assert!(assert_type("q", &json!(["a", "b"]), &TypeSpec::Seq).is_ok());
        assert!(assert_type("q", &json!(["a", 1]), &TypeSpec::Seq).is_err());
        assert!(assert_type("q", &json!("a"), &TypeSpec::Seq).is_err());
        assert!(assert_type("a", &json!({"k": 1}), &TypeSpec::Any).is_ok());
    }

    #[test]
    fn test_opt_rejects_mistyped_default() {
        assert!(Opt::new("one", TypeSpec::Int, json!("not an int"), "help", None).is_err());
    }

    #[test]
    fn test_opt_set_and_reset() {
        let mut opt = Opt::new("one", TypeSpec::Str, json!("done"), "help", None).unwrap();
        assert_eq!(opt.value(), json!("done"));
        assert!(!opt.is_set());

        opt.set_value(json!("xone")).unwrap();
        assert!(opt.is_set());
        assert_eq!(opt.value(), json!("xone"));
        assert_eq!(opt.default(), json!("done"));

        opt.reset();
        assert!(!opt.is_set());
        assert_eq!(opt.value(), json!("done"));
    }

    #[test]
    fn test_typespec_display() {
        assert_eq!(TypeSpec::Str.to_string(), "str");
        assert_eq!(
            TypeSpec::Optional(Box::new(TypeSpec::Int)).to_string(),
            "optional<int>"
        );
        assert_eq!(
            TypeSpec::Tuple(vec![TypeSpec::Str, TypeSpec::Float]).to_string(),
            "(str, float)"
        );
        assert_eq!(TypeSpec::Seq.to_string(), "[str]");
    }
}
