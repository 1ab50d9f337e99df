//! Token-level concerns: address extraction, the major-token registry and
//! filter, and dead-token detection.

pub mod dead;
pub mod extractor;
pub mod registry;

pub use dead::{DeadTokenBlacklist, DeadTokenDetector, DeadVerdict, OnChainReader, TokenVitals};
pub use registry::{DropReason, FilterOutcome, TokenRegistry};
