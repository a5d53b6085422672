//! Payload encryption collaborator contract.
//!
//! The queue never inspects plaintext: when a caller asks for an encrypted
//! payload, the bytes handed to storage are an opaque envelope produced by
//! an implementation of [`PayloadCipher`], and the processor runs them back
//! through `decrypt` before the handler sees them.
//!
//! Envelopes are expected to be self-describing (version prefix), so key
//! rotation is entirely the collaborator's concern. This crate ships no
//! real cipher; see `testing::StaticEnvelopeCipher` for the contract
//! exercised in tests.

use anyhow::Result;
use async_trait::async_trait;

/// Opaque envelope encryption for job payloads.
#[async_trait]
pub trait PayloadCipher: Send + Sync {
    /// Wrap plaintext in a self-describing envelope.
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Recover the plaintext from an envelope produced by `encrypt`.
    async fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>>;
}
