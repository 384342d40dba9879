//! rsnotary-storage: Durable store abstraction
//!
//! This crate provides the storage layer of the uniqueness engine:
//! - UniquenessStore / StoreTransaction traits
//! - In-memory implementation for tests and single-instance development
//! - PostgreSQL implementation for production
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              rsnotary-storage                │
//! ├─────────────────────────────────────────────┤
//! │  traits.rs   - Store trait + record types   │
//! │  memory.rs   - In-memory implementation     │
//! │  postgres.rs - PostgreSQL implementation    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The store is the only resource shared across engine instances. The
//! contract it must honor is narrow: snapshot-consistent reads and atomic
//! multi-row writes within one transaction, so that the conflict check and
//! the commit it guards can never be split by a concurrent writer.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

// Re-export commonly used types
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use postgres::{PostgresConfig, PostgresStore};
pub use traits::{BatchWrite, CommittedState, RequestLogEntry, StoreTransaction, UniquenessStore};
