mod document;
mod event;
mod session;

pub use document::{Collection, RawDocument};
pub use event::{EventKind, NormalizedEvent};
pub use session::SessionContext;
