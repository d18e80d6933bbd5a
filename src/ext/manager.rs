//! Extension lifecycle and event dispatch.
//!
//! `ExtManager` registers and removes extensions, drives the load → ready
//! lifecycle, and broadcasts events to every registered extension in
//! registration order. Dispatch is never concurrent across extensions: the
//! asynchronous variant awaits each handler to completion before visiting
//! the next one.
//!
//! Fault handling during dispatch follows the halt/config/other taxonomy of
//! [`HookError`](super::HookError): halts stop the current event, config
//! errors propagate (their rollback belongs to the option manager), and
//! anything else is logged against the offending extension while dispatch
//! continues.
//!
//! At construction the manager installs one unfiltered change subscription
//! on the option manager and converts every change batch into a synchronous
//! `configure` broadcast — the bridge between configuration and extensions.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, error, info, warn};

use crate::error::{KestrelError, Result};
use crate::events::Event;
use crate::options::{OptManager, Subscription};

use super::{Extension, HookError, HookResult, Loader};

type SharedExt = Rc<RefCell<Box<dyn Extension>>>;
type Registry = Vec<(String, SharedExt)>;

/// Registers extensions and dispatches lifecycle events to them.
pub struct ExtManager {
    registry: Rc<RefCell<Registry>>,
    options: Rc<RefCell<OptManager>>,
    _bridge: Subscription,
}

impl ExtManager {
    /// Create a manager over the shared option manager and install the
    /// configure bridge.
    pub fn new(options: Rc<RefCell<OptManager>>) -> Self {
        let registry: Rc<RefCell<Registry>> = Rc::new(RefCell::new(Vec::new()));
        let weak = Rc::downgrade(&registry);
        let bridge = options.borrow_mut().on_changed(move |manager, updated| {
            let Some(registry) = weak.upgrade() else {
                return Ok(());
            };
            let event = Event::Configure {
                updated: updated.clone(),
            };
            dispatch_sync_over(&snapshot(&registry), manager, &event)
        });

        Self {
            registry,
            options,
            _bridge: bridge,
        }
    }

    /// The shared option manager this host runs on.
    pub fn options(&self) -> Rc<RefCell<OptManager>> {
        Rc::clone(&self.options)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.borrow().iter().any(|(n, _)| n == name)
    }

    /// Registered extension names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.registry.borrow().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.registry.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.borrow().is_empty()
    }

    /// Register an extension.
    ///
    /// Invokes the load hook with a fresh [`Loader`] so the options it
    /// declares exist before anything else runs, inserts the extension into
    /// the registry, resolves any deferred configuration entries that are
    /// now satisfiable, and finally invokes the ready hook with the current
    /// options. Registration hooks are not fault-isolated: their errors
    /// propagate to the caller.
    pub fn register(&mut self, ext: Box<dyn Extension>) -> Result<()> {
        let name = ext.name().to_string();
        if self.contains(&name) {
            return Err(KestrelError::ExtManager(format!(
                "Extension {} already registered",
                name
            )));
        }
        let ext: SharedExt = Rc::new(RefCell::new(ext));

        {
            let mut options = self.options.borrow_mut();
            let mut loader = Loader::new(&mut options);
            let result = ext.borrow_mut().load(&mut loader);
            lift_hook_result(&name, "load", result)?;
        }

        self.registry
            .borrow_mut()
            .push((name.clone(), Rc::clone(&ext)));
        info!(extension = %name, "Registered extension");

        self.options.borrow_mut().process_deferred()?;

        {
            let options = self.options.borrow();
            let result = ext.borrow_mut().ready(&options);
            lift_hook_result(&name, "ready", result)?;
        }
        Ok(())
    }

    /// Add extensions to the end of the chain.
    pub fn add(&mut self, exts: Vec<Box<dyn Extension>>) -> Result<()> {
        for ext in exts {
            self.register(ext)?;
        }
        Ok(())
    }

    /// Remove an extension from the chain, delivering its done hook.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let ext = {
            let mut registry = self.registry.borrow_mut();
            let index = registry
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| {
                    KestrelError::ExtManager(format!("No such extension: {}", name))
                })?;
            registry.remove(index).1
        };
        info!(extension = name, "Removed extension");

        let result = {
            let mut guard = ext.try_borrow_mut().map_err(|_| {
                KestrelError::ExtManager(format!("Extension {} is currently dispatching", name))
            })?;
            guard.done()
        };
        lift_hook_result(name, "done", result)
    }

    /// Remove all extensions, delivering done to each in registration
    /// order.
    pub async fn clear(&mut self) -> Result<()> {
        self.trigger(&Event::Done).await?;
        self.registry.borrow_mut().clear();
        Ok(())
    }

    /// Broadcast an event synchronously, in registration order.
    pub fn trigger_sync(&self, event: &Event) -> Result<()> {
        let exts = snapshot(&self.registry);
        let options = self.options.borrow();
        dispatch_sync_over(&exts, &options, event)
    }

    /// Broadcast an event, awaiting each extension's handler to completion
    /// before visiting the next.
    ///
    /// The option manager stays borrowed for the whole broadcast, across
    /// handler awaits. Handlers receive `&OptManager` and must not borrow
    /// the shared manager mutably through a retained [`options`](Self::options)
    /// handle; doing so panics rather than being skipped like re-entrant
    /// extension delivery.
    pub async fn trigger(&self, event: &Event) -> Result<()> {
        let exts = snapshot(&self.registry);
        let options = self.options.borrow();
        for (name, ext) in &exts {
            let Ok(mut guard) = ext.try_borrow_mut() else {
                warn!(
                    extension = %name,
                    event = event.name(),
                    "Skipping re-entrant dispatch to busy extension"
                );
                continue;
            };
            let result = guard.handle(event, &options).await;
            match absorb_hook_result(name, event, result)? {
                Dispatch::Halt => return Ok(()),
                Dispatch::Continue => {}
            }
        }
        Ok(())
    }
}

fn snapshot(registry: &Rc<RefCell<Registry>>) -> Vec<(String, SharedExt)> {
    registry
        .borrow()
        .iter()
        .map(|(name, ext)| (name.clone(), Rc::clone(ext)))
        .collect()
}

fn dispatch_sync_over(
    exts: &[(String, SharedExt)],
    options: &OptManager,
    event: &Event,
) -> Result<()> {
    for (name, ext) in exts {
        let Ok(mut guard) = ext.try_borrow_mut() else {
            warn!(
                extension = %name,
                event = event.name(),
                "Skipping re-entrant dispatch to busy extension"
            );
            continue;
        };
        let result = guard.dispatch_sync(event, options);
        match absorb_hook_result(name, event, result)? {
            Dispatch::Halt => return Ok(()),
            Dispatch::Continue => {}
        }
    }
    Ok(())
}

enum Dispatch {
    Continue,
    Halt,
}

/// Classify one extension's hook result during a broadcast: halts stop the
/// event, config errors propagate, anything else is logged against the
/// extension and the broadcast continues.
fn absorb_hook_result(name: &str, event: &Event, result: HookResult) -> Result<Dispatch> {
    match result {
        Ok(()) => Ok(Dispatch::Continue),
        Err(HookError::Halt) => {
            debug!(extension = %name, event = event.name(), "Extension halted dispatch");
            Ok(Dispatch::Halt)
        }
        Err(HookError::Config(message)) => Err(KestrelError::Config(message)),
        Err(HookError::Other(err)) => {
            error!(
                extension = %name,
                event = event.name(),
                error = %err,
                "Extension error"
            );
            Ok(Dispatch::Continue)
        }
    }
}

/// Map a hook result from a direct (non-dispatch) invocation into a crate
/// error. Halting outside of dispatch has nothing to short-circuit and is
/// treated as misuse.
fn lift_hook_result(name: &str, hook: &str, result: HookResult) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(HookError::Halt) => Err(KestrelError::ExtManager(format!(
            "Unexpected halt in {} hook of {}",
            hook, name
        ))),
        Err(HookError::Config(message)) => Err(KestrelError::Config(message)),
        Err(HookError::Other(err)) => Err(KestrelError::Extension(err)),
    }
}
