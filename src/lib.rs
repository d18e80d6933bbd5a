//! Kestrel - Typed options registry and extension host core

pub mod error;
pub mod events;
pub mod ext;
pub mod options;

pub use error::{KestrelError, Result};
pub use events::{Event, EventKind};
pub use ext::{ExtManager, Extension, HookError, HookResult, Loader};
pub use options::{OptManager, Opt, Subscription, TypeSpec};
