//! Notarization error taxonomy.
//!
//! `Conflict` and `TimeWindowInvalid` are expected, user-facing outcomes —
//! data, not faults. `General` indicates the engine itself is unhealthy
//! (store failure after retry exhaustion, signing failure). `ServiceStopped`
//! is delivered to requests still queued when the engine shuts down.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{StateRef, TimeWindow, TxId};

/// How the requesting transaction was using a conflicting state.
///
/// Affects only how the conflict is reported, not whether it is one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateUsage {
    /// The requester wanted to consume the state.
    Input,
    /// The requester only observed the state.
    Reference,
}

/// Details of one already-consumed state, as reported to a losing caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateConsumptionDetails {
    /// The transaction that consumed the state.
    pub consumed_by: TxId,
    /// Whether the *requesting* transaction used the state as an input
    /// or a reference.
    pub usage: StateUsage,
}

/// Why a commit request was not notarized.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NotaryError {
    /// One or more requested states were already consumed by a different
    /// transaction. The map identifies exactly which states were taken
    /// and by whom, so the caller can tell "lost a race" from "made an
    /// error".
    #[error("conflict: {} state(s) already consumed", conflicts.len())]
    Conflict {
        conflicts: BTreeMap<StateRef, StateConsumptionDetails>,
    },

    /// The request's validity window does not contain the time at which
    /// it was resolved.
    #[error("time window {time_window:?} invalid at {checked_at}")]
    TimeWindowInvalid {
        time_window: TimeWindow,
        checked_at: DateTime<Utc>,
    },

    /// The engine was shut down before this request reached a batch.
    #[error("notary service stopped before the request was processed")]
    ServiceStopped,

    /// The engine failed to process the batch containing this request.
    /// Operator-facing; the request may be retried.
    #[error("notarization failed: {message}")]
    General { message: String },
}

impl NotaryError {
    /// Builds a conflict error from `(ref, details)` pairs.
    pub fn conflict(
        conflicts: impl IntoIterator<Item = (StateRef, StateConsumptionDetails)>,
    ) -> Self {
        NotaryError::Conflict {
            conflicts: conflicts.into_iter().collect(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        NotaryError::General {
            message: message.into(),
        }
    }
}
