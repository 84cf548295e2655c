//! blechat-core: configuration, identity slots, and the shared message and
//! peer types. All other blechat crates depend on this one.

pub mod config;
pub mod identity;
pub mod message;
pub mod peer;

pub use identity::{IdentityError, IdentityRegistry, IdentitySlot};
pub use message::{Message, Origin};
pub use peer::PeerId;
