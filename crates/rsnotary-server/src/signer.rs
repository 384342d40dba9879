//! Batch signing collaborator boundary.
//!
//! The engine signs at most once per batch, only when at least one request
//! in the batch succeeded, and strictly after the batch's store
//! transaction has committed — never speculatively. The production notary
//! key lives in an external signing service; `Ed25519BatchSigner` is a
//! local implementation of the same contract for tests and development.

use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use rsnotary_domain::{NotarySignature, TxId};

/// Signing errors.
#[derive(Debug, Clone, Error)]
pub enum SignerError {
    #[error("batch signing failed: {message}")]
    Failed { message: String },
}

/// One signature over a whole batch of notarized transactions.
///
/// Produced once per batch; per-transaction signatures are extracted with
/// [`BatchSignature::for_participant`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSignature {
    /// The transactions the signature covers, sorted and distinct.
    tx_ids: Vec<TxId>,
    /// Signature over [`batch_digest`] of `tx_ids`.
    signature: Vec<u8>,
    /// The notary's public key.
    public_key: Vec<u8>,
}

impl BatchSignature {
    pub fn new(tx_ids: Vec<TxId>, signature: Vec<u8>, public_key: Vec<u8>) -> Self {
        debug_assert!(tx_ids.windows(2).all(|w| w[0] < w[1]));
        Self {
            tx_ids,
            signature,
            public_key,
        }
    }

    /// The transactions this signature covers.
    pub fn covered(&self) -> &[TxId] {
        &self.tx_ids
    }

    /// Extracts the signature for one member transaction, or `None` if
    /// the transaction is not covered by this batch.
    pub fn for_participant(&self, tx_id: &TxId) -> Option<NotarySignature> {
        self.tx_ids.binary_search(tx_id).ok().map(|_| NotarySignature {
            tx_id: *tx_id,
            signature: self.signature.clone(),
            public_key: self.public_key.clone(),
        })
    }
}

/// The digest a batch signature covers: SHA-256 over the sorted, distinct
/// transaction ids. Verifiers recompute this from the covered set.
pub fn batch_digest(tx_ids: &[TxId]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for tx_id in tx_ids {
        hasher.update(tx_id.as_bytes());
    }
    hasher.finalize().into()
}

/// Signing capability consumed by the batch processor.
#[async_trait]
pub trait BatchSigner: Send + Sync + 'static {
    /// Signs one batch's worth of transaction ids. Implementations may
    /// assume the engine calls this at most once per batch.
    async fn sign(&self, tx_ids: &[TxId]) -> Result<BatchSignature, SignerError>;
}

/// Local Ed25519 implementation of [`BatchSigner`].
pub struct Ed25519BatchSigner {
    key: SigningKey,
}

impl Ed25519BatchSigner {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Deterministic key from a seed. Test use.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

#[async_trait]
impl BatchSigner for Ed25519BatchSigner {
    async fn sign(&self, tx_ids: &[TxId]) -> Result<BatchSignature, SignerError> {
        let mut ids = tx_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let digest = batch_digest(&ids);
        let signature = self.key.sign(&digest);

        Ok(BatchSignature::new(
            ids,
            signature.to_bytes().to_vec(),
            self.key.verifying_key().to_bytes().to_vec(),
        ))
    }
}
