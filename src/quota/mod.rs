pub mod aggregate;
pub mod clock;
pub mod decision;
pub mod engine;
pub mod inflight;

pub use clock::SystemClock;
pub use decision::DenyReason;
pub use engine::{Admit, QuotaEngine, UsageSnapshot};
