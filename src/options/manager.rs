//! Transactional option manager.
//!
//! `OptManager` owns the option store (registration-ordered), a deferred
//! queue for values supplied before their option exists, and the change
//! subscription broker. All mutations flow through a rollback scope: the
//! whole option set is snapshotted, the batch is applied with per-value
//! type checking, and one change notification fires for the batch. A
//! configuration error anywhere in that scope — including from a change
//! subscriber — restores the snapshot, fires an error notification and
//! re-raises to the caller.
//!
//! Subscriptions are explicit handles: [`subscribe`](OptManager::subscribe)
//! returns a [`Subscription`] token and the broker keeps only a weak
//! liveness reference. Dropping the handle makes the entry inert; it is
//! pruned on the next broadcast. Subscriber callbacks run synchronously
//! inside the post-commit broadcast and therefore must not re-enter
//! `update_known` on the same manager.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{KestrelError, Result};

use super::{Opt, TypeSpec};

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Callback invoked on every matching change batch. Receives the manager
/// itself (post-commit) and the set of updated option names. Returning a
/// `Config` error rolls the batch back.
pub type ChangedFn = Box<dyn FnMut(&OptManager, &BTreeSet<String>) -> Result<()>>;

type ErroredFn = Box<dyn FnMut(&KestrelError)>;

/// Handle returned by [`OptManager::subscribe`] and friends.
///
/// The subscription stays active for as long as this handle is alive;
/// dropping it (or calling [`unsubscribe`](Subscription::unsubscribe))
/// silently retires the entry. Callback lifetime, not the subscription
/// table, decides whether notifications still fire.
#[derive(Debug)]
#[must_use = "dropping the handle cancels the subscription"]
pub struct Subscription {
    _token: Rc<()>,
}

impl Subscription {
    /// Explicitly cancel the subscription.
    pub fn unsubscribe(self) {}
}

struct ChangedHook {
    alive: Weak<()>,
    /// Concrete option names this hook cares about; `None` means every
    /// change batch. Wildcards are expanded before the hook is stored.
    filter: Option<BTreeSet<String>>,
    func: ChangedFn,
}

struct ErroredHook {
    alive: Weak<()>,
    func: ErroredFn,
}

// ---------------------------------------------------------------------------
// Deferred entries
// ---------------------------------------------------------------------------

/// A configuration value supplied before its option exists, queued until
/// registration. Raw set-specs are parsed against the option's type once it
/// appears; each entry is resolved and removed exactly once.
#[derive(Debug, Clone)]
enum Deferred {
    /// Unparsed tokens from the `name=value` mini-language.
    Raw(Vec<String>),
    /// An already-typed value (from `update_deferred`).
    Resolved(Value),
}

// ---------------------------------------------------------------------------
// OptManager
// ---------------------------------------------------------------------------

/// Manages the program options.
///
/// Whenever options are updated, every live change subscription whose
/// filter intersects the batch is invoked with the manager and the set of
/// updated names.
#[derive(Default)]
pub struct OptManager {
    options: HashMap<String, Opt>,
    /// Registration order, for deterministic iteration and listing.
    order: Vec<String>,
    deferred: BTreeMap<String, Deferred>,
    changed: Vec<ChangedHook>,
    errored: Vec<ErroredHook>,
}

impl std::fmt::Debug for OptManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptManager")
            .field("options", &self.order)
            .field("deferred", &self.deferred)
            .finish_non_exhaustive()
    }
}

impl OptManager {
    pub fn new() -> Self {
        // `Self::default()` would resolve to the inherent `default(name)`
        // accessor below, not the derived impl.
        <Self as Default>::default()
    }

    // -- registration -------------------------------------------------------

    /// Register a new option.
    ///
    /// The default is type-checked against `typespec`. Registering a name
    /// that already exists is rejected with a `Config` error. A change
    /// notification for the new name fires immediately after registration.
    pub fn add_option(
        &mut self,
        name: &str,
        typespec: TypeSpec,
        default: Value,
        help: &str,
        choices: Option<Vec<Value>>,
    ) -> Result<()> {
        if self.options.contains_key(name) {
            return Err(KestrelError::Config(format!(
                "Option already registered: {}",
                name
            )));
        }
        let opt = Opt::new(name, typespec, default, help, choices)?;
        self.options.insert(name.to_string(), opt);
        self.order.push(name.to_string());
        debug!(option = name, "Registered option");
        self.notify_changed(&BTreeSet::from([name.to_string()]))
    }

    // -- read access --------------------------------------------------------

    /// The current value of the named option.
    pub fn get(&self, name: &str) -> Result<Value> {
        self.opt(name).map(Opt::value)
    }

    /// The default value of the named option.
    pub fn default(&self, name: &str) -> Result<Value> {
        self.opt(name).map(Opt::default)
    }

    /// Whether the named option has been explicitly set.
    pub fn is_set(&self, name: &str) -> Result<bool> {
        self.opt(name).map(Opt::is_set)
    }

    /// Full metadata for the named option.
    pub fn opt(&self, name: &str) -> Result<&Opt> {
        self.options
            .get(name)
            .ok_or_else(|| KestrelError::Config(format!("No such option: {}", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    /// All options in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Opt> {
        self.order.iter().filter_map(|name| self.options.get(name))
    }

    /// Option names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    // -- transactional updates ----------------------------------------------

    /// Update and set all known options.
    ///
    /// The known subset is applied inside a rollback scope: the option set
    /// is snapshotted, every value is individually type-checked and
    /// applied, then one change notification fires for the whole batch. A
    /// configuration error from any assignment or change subscriber
    /// restores the snapshot, fires an error notification and re-raises.
    ///
    /// Returns the unknown subset; unknown names never raise here.
    pub fn update_known<I>(&mut self, values: I) -> Result<Vec<(String, Value)>>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut known: Vec<(String, Value)> = Vec::new();
        let mut unknown: Vec<(String, Value)> = Vec::new();
        for (name, value) in values {
            if self.options.contains_key(&name) {
                known.push((name, value));
            } else {
                unknown.push((name, value));
            }
        }

        if !known.is_empty() {
            let updated: BTreeSet<String> = known.iter().map(|(name, _)| name.clone()).collect();
            let snapshot = self.options.clone();
            let result = self
                .apply_batch(known)
                .and_then(|()| self.notify_changed(&updated));
            if let Err(err) = result {
                if matches!(err, KestrelError::Config(_)) {
                    self.notify_errored(&err);
                    self.options = snapshot;
                    if let Err(rebroadcast) = self.notify_changed(&updated) {
                        warn!(error = %rebroadcast, "change subscriber failed during rollback");
                    }
                }
                return Err(err);
            }
        }

        Ok(unknown)
    }

    fn apply_batch(&mut self, values: Vec<(String, Value)>) -> Result<()> {
        for (name, value) in values {
            let opt = self
                .options
                .get_mut(&name)
                .ok_or_else(|| KestrelError::Config(format!("No such option: {}", name)))?;
            opt.set_value(value)?;
        }
        Ok(())
    }

    /// Update and set all known options; unknown names are an error.
    pub fn update<I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let unknown = self.update_known(values)?;
        if unknown.is_empty() {
            Ok(())
        } else {
            let names: Vec<String> = unknown.into_iter().map(|(name, _)| name).collect();
            Err(KestrelError::Config(format!(
                "No such option(s): {}",
                names.join(", ")
            )))
        }
    }

    /// Update and set all known options; unknown names are queued for
    /// later processing instead of raising.
    pub fn update_deferred<I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        for (name, value) in self.update_known(values)? {
            self.deferred.insert(name, Deferred::Resolved(value));
        }
        Ok(())
    }

    /// Reset the named option to its default, clearing the is-set flag,
    /// and fire a change notification for it.
    pub fn reset(&mut self, name: &str) -> Result<()> {
        self.options
            .get_mut(name)
            .ok_or_else(|| KestrelError::Config(format!("No such option: {}", name)))?
            .reset();
        self.notify_changed(&BTreeSet::from([name.to_string()]))
    }

    // -- the set mini-language ----------------------------------------------

    /// Process a list of option specifications in the format `name=value`
    /// or bare `name`, and set the values of the known options.
    ///
    /// Repeated `name=value` tokens for the same name accumulate into a
    /// list, used for sequence-typed options. Unknown names are queued raw
    /// when `defer` is true, and are a `Config` error otherwise.
    pub fn set<I, S>(&mut self, specs: I, defer: bool) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut unprocessed: Vec<(String, Vec<String>)> = Vec::new();
        for spec in specs {
            let spec = spec.as_ref();
            let (name, value) = match spec.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => (spec.to_string(), None),
            };
            match unprocessed.iter_mut().find(|(n, _)| *n == name) {
                Some((_, values)) => values.extend(value),
                None => unprocessed.push((name, value.into_iter().collect())),
            }
        }

        let mut processed: Vec<(String, Value)> = Vec::new();
        let mut remainder: Vec<(String, Vec<String>)> = Vec::new();
        for (name, values) in unprocessed {
            match self.options.get(&name) {
                Some(opt) => processed.push((name.clone(), self.parse_setval(opt, &values)?)),
                None => remainder.push((name, values)),
            }
        }

        if defer {
            for (name, values) in remainder {
                self.deferred.insert(name, Deferred::Raw(values));
            }
        } else if !remainder.is_empty() {
            let names: Vec<String> = remainder.into_iter().map(|(name, _)| name).collect();
            return Err(KestrelError::Config(format!(
                "Unknown option(s): {}",
                names.join(", ")
            )));
        }

        self.update(processed)
    }

    /// Parse the collected values of one set-spec against the option's
    /// declared type.
    fn parse_setval(&self, opt: &Opt, values: &[String]) -> Result<Value> {
        if matches!(opt.typespec(), TypeSpec::Seq) {
            return Ok(Value::Array(
                values.iter().cloned().map(Value::String).collect(),
            ));
        }
        if values.len() > 1 {
            return Err(KestrelError::Config(format!(
                "Received multiple values for {}: {:?}",
                opt.name(),
                values
            )));
        }

        let required = || KestrelError::Config(format!("Configuration is required: {}", opt.name()));
        let parse_int = |text: &str| {
            text.parse::<i64>().map(Value::from).map_err(|_| {
                KestrelError::Config(format!("Not an integer: {}", opt.name()))
            })
        };

        let value = values.first().map(String::as_str);
        match opt.typespec() {
            TypeSpec::Str => value
                .map(|v| Value::String(v.to_string()))
                .ok_or_else(required),
            TypeSpec::Optional(inner) if **inner == TypeSpec::Str => {
                Ok(value.map(|v| Value::String(v.to_string())).unwrap_or(Value::Null))
            }
            TypeSpec::Int => match value.filter(|v| !v.is_empty()) {
                Some(v) => parse_int(v),
                None => Err(required()),
            },
            TypeSpec::Optional(inner) if **inner == TypeSpec::Int => {
                match value.filter(|v| !v.is_empty()) {
                    Some(v) => parse_int(v),
                    None => Ok(Value::Null),
                }
            }
            TypeSpec::Bool => match value.filter(|v| !v.is_empty()) {
                None | Some("true") => Ok(Value::Bool(true)),
                Some("false") => Ok(Value::Bool(false)),
                Some(_) => Err(KestrelError::Config(
                    "Boolean must be true, false or have the value omitted.".to_string(),
                )),
            },
            other => Err(KestrelError::Config(format!(
                "Unsupported configuration type for {}: {}",
                opt.name(),
                other
            ))),
        }
    }

    // -- deferred queue ------------------------------------------------------

    /// Process options that were deferred in previous calls to `set` or
    /// `update_deferred` and have since been registered.
    ///
    /// Raw specs are parsed against the now-known type. Entries are removed
    /// from the queue only after the whole batch applies; still-unmatched
    /// entries stay queued.
    pub fn process_deferred(&mut self) -> Result<()> {
        let mut batch: Vec<(String, Value)> = Vec::new();
        for (name, entry) in &self.deferred {
            if let Some(opt) = self.options.get(name) {
                let value = match entry {
                    Deferred::Raw(values) => self.parse_setval(opt, values)?,
                    Deferred::Resolved(value) => value.clone(),
                };
                batch.push((name.clone(), value));
            }
        }

        let applied: Vec<String> = batch.iter().map(|(name, _)| name.clone()).collect();
        self.update(batch)?;
        for name in applied {
            self.deferred.remove(&name);
        }
        Ok(())
    }

    /// Names currently waiting in the deferred queue.
    pub fn deferred_names(&self) -> Vec<&str> {
        self.deferred.keys().map(String::as_str).collect()
    }

    // -- subscriptions -------------------------------------------------------

    /// Subscribe a callback to changes of the listed options.
    ///
    /// A name ending in `*` subscribes to every currently-registered option
    /// under that prefix; the wildcard is expanded here, at subscribe time,
    /// and fails with a `Config` error when it matches nothing. Literal
    /// names must exist.
    pub fn subscribe<F>(&mut self, names: &[&str], func: F) -> Result<Subscription>
    where
        F: FnMut(&OptManager, &BTreeSet<String>) -> Result<()> + 'static,
    {
        let mut subscribed: BTreeSet<String> = BTreeSet::new();
        for name in names {
            if let Some(prefix) = name.strip_suffix('*') {
                let matched: Vec<String> = self
                    .order
                    .iter()
                    .filter(|option| option.starts_with(prefix))
                    .cloned()
                    .collect();
                if matched.is_empty() {
                    return Err(KestrelError::Config(format!("No options matching: {}", name)));
                }
                subscribed.extend(matched);
            } else if self.options.contains_key(*name) {
                subscribed.insert((*name).to_string());
            } else {
                return Err(KestrelError::Config(format!("No such option: {}", name)));
            }
        }

        Ok(self.add_changed_hook(Some(subscribed), Box::new(func)))
    }

    /// Subscribe to every change batch, unfiltered. This is the raw change
    /// signal; [`subscribe`](Self::subscribe) layers name filtering on it.
    pub fn on_changed<F>(&mut self, func: F) -> Subscription
    where
        F: FnMut(&OptManager, &BTreeSet<String>) -> Result<()> + 'static,
    {
        self.add_changed_hook(None, Box::new(func))
    }

    /// Subscribe to rollback error notifications.
    pub fn on_error<F>(&mut self, func: F) -> Subscription
    where
        F: FnMut(&KestrelError) + 'static,
    {
        let token = Rc::new(());
        self.errored.push(ErroredHook {
            alive: Rc::downgrade(&token),
            func: Box::new(func),
        });
        Subscription { _token: token }
    }

    /// Mirror an option's current value into `apply` whenever it changes.
    ///
    /// Returns the subscription handle; the caller keeps it alive for as
    /// long as the binding should hold.
    pub fn bind<F>(&mut self, option: &str, mut apply: F) -> Result<Subscription>
    where
        F: FnMut(&Value) + 'static,
    {
        let name = option.to_string();
        self.subscribe(&[option], move |manager, updated| {
            if updated.contains(&name) {
                apply(&manager.get(&name)?);
            }
            Ok(())
        })
    }

    fn add_changed_hook(&mut self, filter: Option<BTreeSet<String>>, func: ChangedFn) -> Subscription {
        let token = Rc::new(());
        self.changed.push(ChangedHook {
            alive: Rc::downgrade(&token),
            filter,
            func,
        });
        Subscription { _token: token }
    }

    fn notify_changed(&mut self, updated: &BTreeSet<String>) -> Result<()> {
        // The hook list is moved out so callbacks can receive `&self`
        // without aliasing it; dead entries are pruned on the way back in.
        let mut hooks = std::mem::take(&mut self.changed);
        let mut result = Ok(());
        for hook in hooks.iter_mut() {
            if hook.alive.strong_count() == 0 {
                continue;
            }
            if let Some(filter) = &hook.filter {
                if filter.is_disjoint(updated) {
                    continue;
                }
            }
            if let Err(err) = (hook.func)(self, updated) {
                result = Err(err);
                break;
            }
        }
        hooks.retain(|hook| hook.alive.strong_count() > 0);
        let added = std::mem::take(&mut self.changed);
        self.changed = hooks;
        self.changed.extend(added);
        result
    }

    fn notify_errored(&mut self, err: &KestrelError) {
        let mut hooks = std::mem::take(&mut self.errored);
        for hook in hooks.iter_mut() {
            if hook.alive.strong_count() > 0 {
                (hook.func)(err);
            }
        }
        hooks.retain(|hook| hook.alive.strong_count() > 0);
        let added = std::mem::take(&mut self.errored);
        self.errored = hooks;
        self.errored.extend(added);
    }

    // -- namespace views ----------------------------------------------------

    /// A read-only view over every option under `prefix.`, or a `Config`
    /// error when no registered option lives there.
    pub fn namespace<'a>(&'a self, prefix: &str) -> Result<Namespace<'a>> {
        self.check_namespace(prefix)?;
        Ok(Namespace {
            manager: self,
            prefix: prefix.to_string(),
        })
    }

    /// A read/write view over every option under `prefix.`.
    pub fn namespace_mut<'a>(&'a mut self, prefix: &str) -> Result<NamespaceMut<'a>> {
        self.check_namespace(prefix)?;
        Ok(NamespaceMut {
            prefix: prefix.to_string(),
            manager: self,
        })
    }

    fn check_namespace(&self, prefix: &str) -> Result<()> {
        let dotted = format!("{}.", prefix);
        if self.order.iter().any(|name| name.starts_with(&dotted)) {
            Ok(())
        } else {
            Err(KestrelError::Config(format!(
                "No such configuration namespace: {}",
                prefix
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Namespace views
// ---------------------------------------------------------------------------

/// A dotted-prefix view exposing a subset of options as a sub-object.
///
/// Owns no option storage, only the prefix and a manager reference.
pub struct Namespace<'a> {
    manager: &'a OptManager,
    prefix: String,
}

impl<'a> Namespace<'a> {
    fn full(&self, key: &str) -> String {
        format!("{}.{}", self.prefix, key)
    }

    pub fn get(&self, key: &str) -> Result<Value> {
        self.manager.get(&self.full(key))
    }

    pub fn default(&self, key: &str) -> Result<Value> {
        self.manager.default(&self.full(key))
    }

    pub fn is_set(&self, key: &str) -> Result<bool> {
        self.manager.is_set(&self.full(key))
    }

    /// Key suffixes under this prefix, in registration order.
    pub fn keys(&self) -> Vec<String> {
        let dotted = format!("{}.", self.prefix);
        self.manager
            .order
            .iter()
            .filter_map(|name| name.strip_prefix(&dotted))
            .map(String::from)
            .collect()
    }

    /// The options under this prefix, in registration order.
    pub fn options(&self) -> impl Iterator<Item = &Opt> {
        let dotted = format!("{}.", self.prefix);
        self.manager
            .iter()
            .filter(move |opt| opt.name().starts_with(&dotted))
    }
}

/// A writable dotted-prefix view; `set` goes through the manager's normal
/// rollback scope and fires change notifications.
pub struct NamespaceMut<'a> {
    manager: &'a mut OptManager,
    prefix: String,
}

impl<'a> NamespaceMut<'a> {
    fn full(&self, key: &str) -> String {
        format!("{}.{}", self.prefix, key)
    }

    pub fn get(&self, key: &str) -> Result<Value> {
        self.manager.get(&self.full(key))
    }

    pub fn is_set(&self, key: &str) -> Result<bool> {
        self.manager.is_set(&self.full(key))
    }

    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let name = self.full(key);
        self.manager.update([(name, value)])
    }
}
