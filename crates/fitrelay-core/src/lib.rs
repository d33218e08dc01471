//! Event model for the fitness-event relay: canonical encoding, signatures,
//! privacy classification, and subscription filters.
//!
//! # Modules
//!
//! - [`event`]: `Event`, canonical encoding, id derivation, signing/verification
//! - [`privacy`]: maps an event to a `PrivacyLevel`
//! - [`filter`]: subscription filters and match semantics
//! - [`error`]: the validation error taxonomy

pub mod error;
pub mod event;
pub mod filter;
pub mod privacy;

pub use error::{Error, Result};
pub use event::{Event, Tag, UnsignedEvent};
pub use filter::Filter;
pub use privacy::PrivacyLevel;
