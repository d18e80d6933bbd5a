//! Configuration file loading.
//!
//! Parses hierarchical TOML documents into flat dotted-key maps applied
//! through [`OptManager`]. Nested tables flatten to dotted keys
//! (`[intents] guilds = true` becomes `intents.guilds`); string leaves get
//! environment-variable expansion; everything else passes through
//! unchanged. Files are applied in caller-specified order, and a failure at
//! one path is wrapped with that path's identity.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{KestrelError, Result};

use super::manager::OptManager;

/// `$NAME` or `${NAME}`.
static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:\{([^}]+)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("env var pattern is valid")
});

/// Expand environment variables in a string value. References to unset
/// variables are left verbatim.
fn expand_vars(text: &str) -> String {
    ENV_VAR
        .replace_all(text, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

fn toml_to_value(value: toml::Value) -> Value {
    match value {
        toml::Value::String(text) => Value::String(text),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => {
            Value::Array(items.into_iter().map(toml_to_value).collect())
        }
        // Only reachable for tables nested inside arrays; top-level and
        // nested tables are flattened to dotted keys before conversion.
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(key, value)| (key, toml_to_value(value)))
                .collect(),
        ),
    }
}

/// Flatten a parsed TOML table into dotted option keys.
pub fn flatten(table: toml::Table) -> BTreeMap<String, Value> {
    let mut options = BTreeMap::new();
    for (key, value) in table {
        match value {
            toml::Value::Table(inner) => {
                for (suffix, value) in flatten(inner) {
                    options.insert(format!("{}.{}", key, suffix), value);
                }
            }
            toml::Value::String(text) => {
                options.insert(key, Value::String(expand_vars(&text)));
            }
            other => {
                options.insert(key, toml_to_value(other));
            }
        }
    }
    options
}

/// Parse a configuration document into a flat dotted-key map.
///
/// Empty input yields an empty map; a malformed document is a `Config`
/// error naming the cause.
pub fn parse(text: &str) -> Result<BTreeMap<String, Value>> {
    if text.is_empty() {
        return Ok(BTreeMap::new());
    }
    let table: toml::Table = toml::from_str(text)
        .map_err(|err| KestrelError::Config(format!("Error parsing configuration: {}", err)))?;
    Ok(flatten(table))
}

/// Load options from text, overwriting parameters that are already set.
///
/// Unknown keys are a `Config` error unless `defer` is true, in which case
/// they are queued for later processing.
pub fn load(options: &mut OptManager, text: &str, defer: bool) -> Result<()> {
    let parsed = parse(text)?;
    if defer {
        options.update_deferred(parsed)
    } else {
        options.update(parsed)
    }
}

/// Expand a leading `~` to the user's home directory. Paths that do not
/// start with `~`, and `~user` forms, pass through unchanged.
fn expand_home(path: &Path) -> PathBuf {
    let Some(home) = dirs::home_dir() else {
        return path.to_path_buf();
    };
    if path == Path::new("~") {
        return home;
    }
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Load configuration files in order. A leading `~` in a path refers to the
/// user's home directory. Paths that do not exist are skipped; a read or
/// parse failure at one path is wrapped with that path.
pub fn load_paths<I, P>(options: &mut OptManager, paths: I, defer: bool) -> Result<()>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    for path in paths {
        let path = expand_home(path.as_ref());
        let path = path.as_path();
        if !path.is_file() {
            debug!(path = %path.display(), "Config path does not exist, skipping");
            continue;
        }
        let text = std::fs::read_to_string(path)
            .map_err(|err| wrap_path_error(path, &err.to_string()))?;
        load(options, &text, defer).map_err(|err| {
            let message = match err {
                KestrelError::Config(message) => message,
                other => other.to_string(),
            };
            wrap_path_error(path, &message)
        })?;
        info!(path = %path.display(), "Loaded configuration file");
    }
    Ok(())
}

fn wrap_path_error(path: &Path, message: &str) -> KestrelError {
    KestrelError::Config(format!("Error reading {}: {}", path.display(), message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TypeSpec;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_parse_flattens_nested_tables() {
        let parsed = parse("token = \"abc\"\n\n[intents]\nguilds = true\nmembers = false\n")
            .unwrap();
        assert_eq!(parsed.get("token"), Some(&json!("abc")));
        assert_eq!(parsed.get("intents.guilds"), Some(&json!(true)));
        assert_eq!(parsed.get("intents.members"), Some(&json!(false)));
    }

    #[test]
    fn test_parse_empty_is_empty() {
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_malformed_errors() {
        let err = parse("not valid toml [[").unwrap_err();
        assert!(err.to_string().contains("Error parsing configuration"));
    }

    #[test]
    fn test_string_leaves_expand_env_vars() {
        std::env::set_var("KESTREL_TEST_HOME", "/home/kes");
        let parsed = parse("confdir = \"$KESTREL_TEST_HOME/.config\"\n").unwrap();
        assert_eq!(parsed.get("confdir"), Some(&json!("/home/kes/.config")));

        let parsed = parse("confdir = \"${KESTREL_TEST_HOME}/conf\"\n").unwrap();
        assert_eq!(parsed.get("confdir"), Some(&json!("/home/kes/conf")));
    }

    #[test]
    fn test_unset_env_vars_pass_through() {
        let parsed = parse("path = \"$KESTREL_TEST_DEFINITELY_UNSET/x\"\n").unwrap();
        assert_eq!(
            parsed.get("path"),
            Some(&json!("$KESTREL_TEST_DEFINITELY_UNSET/x"))
        );
    }

    #[test]
    fn test_non_string_leaves_pass_through() {
        let parsed = parse("count = 3\nratio = 0.5\nnames = [\"a\", \"b\"]\n").unwrap();
        assert_eq!(parsed.get("count"), Some(&json!(3)));
        assert_eq!(parsed.get("ratio"), Some(&json!(0.5)));
        assert_eq!(parsed.get("names"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn test_load_unknown_key_errors_without_defer() {
        let mut options = OptManager::new();
        options
            .add_option("token", TypeSpec::Str, json!(""), "help", None)
            .unwrap();
        let err = load(&mut options, "ghost = 1\n", false).unwrap_err();
        assert!(err.to_string().contains("No such option(s): ghost"));
    }

    #[test]
    fn test_load_defers_unknown_keys() {
        let mut options = OptManager::new();
        options
            .add_option("token", TypeSpec::Str, json!(""), "help", None)
            .unwrap();
        load(&mut options, "token = \"abc\"\nghost = 1\n", true).unwrap();
        assert_eq!(options.get("token").unwrap(), json!("abc"));
        assert_eq!(options.deferred_names(), vec!["ghost"]);
    }

    #[test]
    fn test_load_paths_skips_missing_and_applies_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.toml");
        let second = dir.path().join("second.toml");
        std::fs::write(&first, "token = \"one\"\n").unwrap();
        std::fs::write(&second, "token = \"two\"\n").unwrap();

        let mut options = OptManager::new();
        options
            .add_option("token", TypeSpec::Str, json!(""), "help", None)
            .unwrap();
        load_paths(
            &mut options,
            [
                dir.path().join("missing.toml"),
                first.clone(),
                second.clone(),
            ],
            false,
        )
        .unwrap();
        assert_eq!(options.get("token").unwrap(), json!("two"));
    }

    #[test]
    fn test_load_paths_expands_home_prefix() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(home.path().join("options.toml"), "token = \"abc\"\n").unwrap();
        std::env::set_var("HOME", home.path());

        let mut options = OptManager::new();
        options
            .add_option("token", TypeSpec::Str, json!(""), "help", None)
            .unwrap();
        load_paths(&mut options, ["~/options.toml"], false).unwrap();
        assert_eq!(options.get("token").unwrap(), json!("abc"));
    }

    #[test]
    fn test_load_paths_wraps_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.toml");
        let mut file = std::fs::File::create(&broken).unwrap();
        file.write_all(b"not valid toml [[").unwrap();

        let mut options = OptManager::new();
        let err = load_paths(&mut options, [broken.clone()], false).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("broken.toml"));
        assert!(message.contains("Error parsing configuration"));
    }
}
