//! Test support: a contract-faithful stub cipher and an event recorder.
//!
//! These are real implementations of the crate's collaborator contracts,
//! not mocks of its internals; the integration suites drive the production
//! code paths through them.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::bus::{Event, EventBus, Subscription};
use crate::crypto::PayloadCipher;

/// Envelope version prefix used by [`StaticEnvelopeCipher`].
const ENVELOPE_V1: &[u8] = b"env1\0";

/// A [`PayloadCipher`] that frames and obfuscates instead of encrypting.
///
/// It keeps the collaborator contract honest - envelopes are
/// self-describing, decrypt rejects foreign bytes, round trips are exact -
/// without pretending to be cryptography.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvelopeCipher {
    key: u8,
}

impl StaticEnvelopeCipher {
    pub fn new() -> Self {
        Self { key: 0x5a }
    }
}

#[async_trait]
impl PayloadCipher for StaticEnvelopeCipher {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut envelope = Vec::with_capacity(ENVELOPE_V1.len() + plaintext.len());
        envelope.extend_from_slice(ENVELOPE_V1);
        envelope.extend(plaintext.iter().map(|b| b ^ self.key));
        Ok(envelope)
    }

    async fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        let Some(body) = envelope.strip_prefix(ENVELOPE_V1) else {
            bail!("unrecognised payload envelope");
        };
        Ok(body.iter().map(|b| b ^ self.key).collect())
    }
}

/// Subscribes to events of type `E` and keeps every one it sees.
pub struct EventRecorder<E: Event> {
    events: Arc<Mutex<Vec<E>>>,
    subscription: Subscription,
}

impl<E: Event> EventRecorder<E> {
    pub fn attach(bus: &EventBus) -> Self {
        let events: Arc<Mutex<Vec<E>>> = Arc::default();
        let sink = events.clone();
        let subscription = bus.subscribe::<E, _, _>(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap_or_else(|e| e.into_inner()).push(event);
                Ok(())
            }
        });
        Self {
            events,
            subscription,
        }
    }

    pub fn events(&self) -> Vec<E> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn detach(&self) {
        self.subscription.unsubscribe();
    }
}
