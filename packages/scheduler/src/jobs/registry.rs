//! Handler registry.
//!
//! Maps job type strings to async handlers. Consumers register their
//! handlers at startup; the processor claims only registered types and
//! dispatches through here. Handler return values are opaque
//! JSON-serialisable data - dynamic schedules read their next run time out
//! of them.

use std::collections::HashMap;
use std::future::Future;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use super::cancel::CancelToken;

/// Everything a handler gets about its job. The payload is already
/// decrypted when it was stored encrypted.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub job_type: String,
    /// 0-based attempt number; 1+ means this is a retry.
    pub attempt: i32,
    pub payload: Option<Vec<u8>>,
    pub cancel: CancelToken,
}

impl JobContext {
    /// Deserialize the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = self
            .payload
            .as_deref()
            .ok_or_else(|| anyhow!("job {} has no payload", self.job_id))?;
        serde_json::from_slice(bytes)
            .map_err(|e| anyhow!("failed to deserialize payload for job {}: {}", self.job_id, e))
    }
}

type BoxedHandler =
    Box<dyn Fn(JobContext) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync>;

/// Registry that maps job type strings to handlers.
///
/// Fixed after startup: register everything, then share it behind an `Arc`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `job_type`.
    ///
    /// # Panics
    ///
    /// Panics if the type already has a handler; two handlers for one type
    /// is a programming error.
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let job_type = job_type.into();
        if self.handlers.contains_key(&job_type) {
            panic!("handler already registered for job type: {job_type}");
        }
        self.handlers
            .insert(job_type, Box::new(move |ctx| Box::pin(handler(ctx))));
    }

    /// Run the handler registered for the context's job type.
    pub async fn execute(&self, ctx: JobContext) -> Result<Option<Value>> {
        let handler = self
            .handlers
            .get(&ctx.job_type)
            .ok_or_else(|| anyhow!("no handler registered for job type: {}", ctx.job_type))?;
        handler(ctx).await
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered_types", &self.registered_types())
            .finish()
    }
}
