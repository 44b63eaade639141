//! Sliding-window rate limiting primitives.

mod clock;
mod composite;
mod counter;
mod decision;
mod key;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use composite::{CompositeLimiter, Dimension};
pub use counter::{retry_after, EventLog, LimitSpec, SlidingWindowCounter};
pub use decision::AdmissionDecision;
pub use key::{RateKey, CREDENTIAL_PREFIX, SOURCE_ADDRESS_PREFIX};
pub use store::{EventStore, MemoryStore};
