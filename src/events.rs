//! Lifecycle events broadcast to extensions.
//!
//! The set of event variants is closed: every variant declares its dispatch
//! name and ordered field list directly, and [`EventKind::ALL`] is the
//! host-wide registry, populated at compile time. There is no runtime name
//! derivation and no mutable registry to collide in.
//!
//! `load` is listed as a kind for completeness but has no [`Event`] variant:
//! the load hook is invoked exactly once during registration with the
//! [`crate::ext::Loader`] capability and is never re-broadcast.

use std::collections::BTreeSet;

/// The dispatch name of every hook an extension may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Option registration phase, once per extension at registration.
    Load,
    /// A batch of options changed.
    Configure,
    /// Initial options have been applied; the host is about to run.
    Ready,
    /// The extension is being removed (or the host is shutting down).
    Done,
}

impl EventKind {
    /// Every event kind the host can dispatch, in lifecycle order.
    pub const ALL: [EventKind; 4] = [
        EventKind::Load,
        EventKind::Configure,
        EventKind::Ready,
        EventKind::Done,
    ];

    /// The dispatch name extensions implement a hook under.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Load => "load",
            EventKind::Configure => "configure",
            EventKind::Ready => "ready",
            EventKind::Done => "done",
        }
    }

    /// Look a kind up by dispatch name.
    pub fn from_name(name: &str) -> Option<EventKind> {
        EventKind::ALL.iter().copied().find(|k| k.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A broadcastable event, carrying the arguments of its hook.
#[derive(Debug, Clone)]
pub enum Event {
    /// Options changed; `updated` holds the names of every changed option
    /// in the batch. Handlers also receive the option manager itself.
    Configure { updated: BTreeSet<String> },
    /// The extension chain has been loaded and configured with the initial
    /// options from the command line and the configuration file.
    Ready,
    /// Sent before an extension is dropped from the chain.
    Done,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Configure { .. } => EventKind::Configure,
            Event::Ready => EventKind::Ready,
            Event::Done => EventKind::Done,
        }
    }

    /// The dispatch name of this event.
    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }
}
