//! The extension contract.
//!
//! An extension is a pluggable component participating in the
//! load → ready → configure → done lifecycle. It implements any subset of
//! the hooks on [`Extension`]; every hook defaults to a no-op. The load
//! hook runs exactly once, during registration, and receives a [`Loader`] —
//! the capability through which the extension declares its options.
//!
//! Hooks report through [`HookResult`]:
//!
//! - `Err(HookError::Halt)` deliberately stops dispatch of the *current*
//!   event to all remaining extensions. It is a control value, not a fault.
//! - `Err(HookError::Config(..))` propagates out of dispatch entirely; its
//!   rollback is owned by the option manager, not the dispatcher.
//! - Any other failure (`HookError::Other`) is isolated to the extension:
//!   logged, and dispatch continues.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::{KestrelError, Result};
use crate::events::Event;
use crate::options::{OptManager, TypeSpec};

mod manager;

pub use manager::ExtManager;

// ---------------------------------------------------------------------------
// Hook results
// ---------------------------------------------------------------------------

/// How an extension hook may fail (or deliberately short-circuit).
#[derive(Debug, Error)]
pub enum HookError {
    /// Stop dispatching the current event to the remaining extensions.
    /// Not a fault.
    #[error("halt")]
    Halt,

    /// A configuration error; propagates out of dispatch so the option
    /// manager can roll the pending batch back.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Anything else. Isolated per extension during dispatch.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<KestrelError> for HookError {
    fn from(err: KestrelError) -> Self {
        match err {
            KestrelError::Config(message) => HookError::Config(message),
            KestrelError::Extension(inner) => HookError::Other(inner),
            other => HookError::Other(anyhow::Error::new(other)),
        }
    }
}

/// The result type every extension hook returns.
pub type HookResult = std::result::Result<(), HookError>;

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Capability handed to an extension exactly once, during registration,
/// through which it may register options.
pub struct Loader<'a> {
    options: &'a mut OptManager,
}

impl<'a> Loader<'a> {
    pub(crate) fn new(options: &'a mut OptManager) -> Self {
        Self { options }
    }

    /// Register an option on the host's option manager.
    pub fn add_option(
        &mut self,
        name: &str,
        typespec: TypeSpec,
        default: Value,
        help: &str,
        choices: Option<Vec<Value>>,
    ) -> Result<()> {
        self.options.add_option(name, typespec, default, help, choices)
    }
}

// ---------------------------------------------------------------------------
// Extension trait
// ---------------------------------------------------------------------------

/// A host extension.
///
/// Hooks are invoked with the event's field values in declaration order;
/// `configure` additionally receives the option manager so handlers can
/// read current values without re-locking anything. Handlers must not
/// re-enter the manager's update operations — subscriber callbacks run
/// synchronously inside the post-commit broadcast.
///
/// Override [`handle`](Extension::handle) for asynchronous work; the
/// default routes every event to the matching synchronous hook.
#[async_trait(?Send)]
pub trait Extension {
    /// The extension's registry name. Duplicate names are rejected at
    /// registration.
    fn name(&self) -> &'static str;

    /// Option registration phase; runs before any other hook.
    fn load(&mut self, _loader: &mut Loader<'_>) -> HookResult {
        Ok(())
    }

    /// A batch of options changed; `updated` names every changed option.
    fn configure(&mut self, _options: &OptManager, _updated: &BTreeSet<String>) -> HookResult {
        Ok(())
    }

    /// The host has applied its initial configuration.
    fn ready(&mut self, _options: &OptManager) -> HookResult {
        Ok(())
    }

    /// The extension is about to be dropped from the chain.
    fn done(&mut self) -> HookResult {
        Ok(())
    }

    /// Route an event to the matching synchronous hook.
    fn dispatch_sync(&mut self, event: &Event, options: &OptManager) -> HookResult {
        match event {
            Event::Configure { updated } => self.configure(options, updated),
            Event::Ready => self.ready(options),
            Event::Done => self.done(),
        }
    }

    /// Asynchronous dispatch entry point, awaited to completion before the
    /// next extension is visited.
    async fn handle(&mut self, event: &Event, options: &OptManager) -> HookResult {
        self.dispatch_sync(event, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hook_error_from_kestrel_config() {
        let err: HookError = KestrelError::Config("No such option: x".to_string()).into();
        assert!(matches!(err, HookError::Config(_)));
    }

    #[test]
    fn test_hook_error_from_anyhow() {
        let err: HookError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, HookError::Other(_)));
    }

    #[test]
    fn test_loader_registers_on_manager() {
        let mut options = OptManager::new();
        {
            let mut loader = Loader::new(&mut options);
            loader
                .add_option("echo.enabled", TypeSpec::Bool, json!(false), "help", None)
                .unwrap();
        }
        assert!(options.contains("echo.enabled"));
        assert_eq!(options.get("echo.enabled").unwrap(), json!(false));
    }
}
