//! Process instance identity.
//!
//! Every process gets one random UUID at first use. The value is stable
//! until process exit and is used as the owner token when claiming jobs, so
//! orphaned leases can be traced back to the instance that died holding
//! them.

use std::fmt;
use std::sync::OnceLock;

use uuid::Uuid;

static CURRENT: OnceLock<InstanceId> = OnceLock::new();

/// A stable per-process identifier used as the job-claim owner token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceId {
    id: String,
}

impl InstanceId {
    /// The identity of this process. Minted on first call, stable afterwards.
    pub fn current() -> &'static InstanceId {
        CURRENT.get_or_init(InstanceId::random)
    }

    /// Mint a fresh identity. Tests use this to simulate several owners in
    /// one process.
    pub fn random() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
