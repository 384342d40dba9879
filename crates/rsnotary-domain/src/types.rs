//! Ledger value types used throughout the engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NotaryError;

/// A transaction identifier: the 32-byte hash of the transaction.
///
/// Cheap to copy and totally ordered so it can be used as a map key.
/// Displays as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub [u8; 32]);

impl TxId {
    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses a transaction id from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TxIdParseError> {
        let bytes = hex::decode(s).map_err(|_| TxIdParseError {
            value: s.to_string(),
        })?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| TxIdParseError {
            value: s.to_string(),
        })?;
        Ok(TxId(bytes))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to correlate log lines
        write!(f, "TxId({}..)", &hex::encode(self.0)[..8])
    }
}

impl From<[u8; 32]> for TxId {
    fn from(bytes: [u8; 32]) -> Self {
        TxId(bytes)
    }
}

/// Error parsing a [`TxId`] from hex.
#[derive(Debug, thiserror::Error)]
#[error("invalid transaction id: {value}")]
pub struct TxIdParseError {
    pub value: String,
}

/// Identifies one unit of consumable ledger state: an output of a
/// previously notarized transaction.
///
/// Ordered by `(tx_id, output_index)` so it can key a `BTreeMap` and
/// produce deterministic iteration order in conflict reports.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateRef {
    /// The transaction that produced this state.
    pub tx_id: TxId,
    /// The position of this state among the transaction's outputs.
    pub output_index: u32,
}

impl StateRef {
    pub fn new(tx_id: TxId, output_index: u32) -> Self {
        Self {
            tx_id,
            output_index,
        }
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.output_index)
    }
}

impl fmt::Debug for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateRef({}..:{})", &hex::encode(self.tx_id.0)[..8], self.output_index)
    }
}

impl FromStr for StateRef {
    type Err = StateRefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tx, index) = s.rsplit_once(':').ok_or_else(|| StateRefParseError {
            value: s.to_string(),
        })?;
        let tx_id = TxId::from_hex(tx).map_err(|_| StateRefParseError {
            value: s.to_string(),
        })?;
        let output_index = index.parse().map_err(|_| StateRefParseError {
            value: s.to_string(),
        })?;
        Ok(StateRef {
            tx_id,
            output_index,
        })
    }
}

/// Error parsing a [`StateRef`] from its `txid:index` form.
#[derive(Debug, thiserror::Error)]
#[error("invalid state reference: {value}")]
pub struct StateRefParseError {
    pub value: String,
}

/// The identity of the caller requesting notarization.
///
/// Opaque to the engine; recorded in the request audit log. Identity
/// verification happens upstream, before a request reaches this engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Party(pub String);

impl Party {
    pub fn new(name: impl Into<String>) -> Self {
        Party(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The validity interval within which a transaction must be notarized.
///
/// Either bound may be absent (open interval). A window is valid at
/// instant `now` when `from_time <= now < until_time`, treating absent
/// bounds as unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from_time: Option<DateTime<Utc>>,
    pub until_time: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// A window that only becomes valid at `from`.
    pub fn from_only(from: DateTime<Utc>) -> Self {
        Self {
            from_time: Some(from),
            until_time: None,
        }
    }

    /// A window that expires at `until`.
    pub fn until_only(until: DateTime<Utc>) -> Self {
        Self {
            from_time: None,
            until_time: Some(until),
        }
    }

    /// A window bounded on both ends.
    pub fn between(from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            from_time: Some(from),
            until_time: Some(until),
        }
    }

    /// Whether `now` falls inside this window.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        if let Some(from) = self.from_time {
            if now < from {
                return false;
            }
        }
        if let Some(until) = self.until_time {
            if now >= until {
                return false;
            }
        }
        true
    }
}

/// One notarization request as seen by the resolver.
///
/// Input states are exclusively consumed; reference states are observed
/// read-only but still participate in conflict detection. The request
/// signature is opaque audit material — it was verified upstream.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    /// States this transaction consumes. May be empty for reference-only
    /// or time-window-only transactions.
    pub inputs: Vec<StateRef>,
    /// States this transaction observes without consuming.
    pub references: Vec<StateRef>,
    /// The transaction being notarized.
    pub tx_id: TxId,
    /// Who asked.
    pub caller: Party,
    /// The caller's signature over the request, kept for audit only.
    pub request_signature: Vec<u8>,
    /// Optional validity window, checked at resolution time.
    pub time_window: Option<TimeWindow>,
}

/// A per-transaction notary signature extracted from a batch signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotarySignature {
    /// The transaction this signature covers.
    pub tx_id: TxId,
    /// Raw signature bytes over the batch digest.
    pub signature: Vec<u8>,
    /// The notary's public key.
    pub public_key: Vec<u8>,
}

/// The outcome delivered to a caller for one commit request.
pub type Outcome = Result<NotarySignature, NotaryError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tx(n: u8) -> TxId {
        TxId([n; 32])
    }

    #[test]
    fn test_txid_hex_round_trip() {
        let id = tx(0xab);
        let hex = id.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(TxId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn test_txid_rejects_bad_hex() {
        assert!(TxId::from_hex("zz").is_err());
        assert!(TxId::from_hex("abcd").is_err()); // too short
    }

    #[test]
    fn test_state_ref_ordering() {
        let a = StateRef::new(tx(1), 0);
        let b = StateRef::new(tx(1), 1);
        let c = StateRef::new(tx(2), 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_state_ref_parse_round_trip() {
        let r = StateRef::new(tx(7), 3);
        let parsed: StateRef = r.to_string().parse().unwrap();
        assert_eq!(parsed, r);
    }

    #[test]
    fn test_state_ref_parse_rejects_garbage() {
        assert!("not-a-ref".parse::<StateRef>().is_err());
        assert!("abcd:1".parse::<StateRef>().is_err());
    }

    #[test]
    fn test_state_ref_serde_round_trip() {
        let r = StateRef::new(tx(5), 2);
        let json = serde_json::to_string(&r).unwrap();
        let back: StateRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_time_window_contains() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let mid = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let window = TimeWindow::between(t0, t1);
        assert!(window.contains(mid));
        assert!(window.contains(t0)); // inclusive lower bound
        assert!(!window.contains(t1)); // exclusive upper bound

        assert!(TimeWindow::until_only(t1).contains(t0));
        assert!(!TimeWindow::until_only(t0).contains(mid));
        assert!(TimeWindow::from_only(t1).contains(t1));
        assert!(!TimeWindow::from_only(t1).contains(mid));
    }
}
