//! rsnotary-domain: Core notarization domain logic
//!
//! This crate contains the pure decision logic of the uniqueness engine:
//! - Ledger value types (transaction ids, state references, time windows)
//! - The batch resolver that classifies commit requests
//! - Error taxonomy for notarization outcomes
//! - Clock abstraction for time-window validation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               rsnotary-domain                │
//! ├─────────────────────────────────────────────┤
//! │  types.rs    - TxId, StateRef, TimeWindow   │
//! │  resolver.rs - Batch conflict resolution    │
//! │  error.rs    - Notarization error taxonomy  │
//! │  clock.rs    - Injectable clock             │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Everything here is synchronous and side-effect free; storage and
//! scheduling live in `rsnotary-storage` and `rsnotary-server`.

pub mod clock;
pub mod error;
pub mod resolver;
pub mod types;

// Re-export commonly used types at the crate root
pub use clock::{Clock, SystemClock};
pub use error::{NotaryError, StateConsumptionDetails, StateUsage};
pub use resolver::{resolve_batch, Decision, ResolvedBatch};
pub use types::{CommitRequest, NotarySignature, Outcome, Party, StateRef, TimeWindow, TxId};
