//! rsnotary-server: The uniqueness engine service
//!
//! This crate wires the domain resolver and the durable store into a
//! running service:
//! - NotaryService: the ingress API — enqueue a commit request, get a
//!   one-shot handle that resolves with the outcome
//! - BatchProcessor: the single dedicated worker that drains the queue
//!   into batches, runs conflict detection and resolution inside one
//!   store transaction, and delivers results after durability
//! - BatchSigner: the signing collaborator boundary, with a local
//!   Ed25519 implementation
//! - Configuration and logging setup
//!
//! # Architecture
//!
//! ```text
//! callers ──commit()──► bounded queue ──► BatchProcessor ──► UniquenessStore
//!    ▲                                        │                (one txn/batch)
//!    └────────── one-shot outcome ◄── sign ◄──┘
//! ```
//!
//! Many callers enqueue concurrently; exactly one worker drains. The
//! worker never completes a handle before the batch's store transaction
//! has committed.

pub mod config;
pub mod logging;
pub mod processor;
pub mod service;
pub mod signer;

// Re-export commonly used types at the crate root
pub use config::{
    build_store, BuildStoreError, ConfigLoadError, EngineSettings, LoggingSettings, NotaryConfig,
    StorageSettings,
};
pub use logging::{init_logging, LoggingConfig};
pub use service::{CommitHandle, NotaryService};
pub use signer::{BatchSignature, BatchSigner, Ed25519BatchSigner, SignerError};
