//! Distributed generation lease: keeps at most one generation per
//! (user, category) in flight across every API instance.
//!
//! In-process deduplication happens in the coordinator; this lease covers the
//! multi-instance case. It is held for one attempt only and carries a TTL so a
//! crashed holder cannot wedge the key.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::Client as RedisClient;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::insights::errors::InsightError;

const KEY_PREFIX: &str = "insight:lock:";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Compare-and-delete: only the holder's token may release the lease.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Proof of holding the lease for `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    token: String,
}

impl Lease {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4().to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[async_trait]
pub trait GenerationLock: Send + Sync {
    /// Tries to take the lease, polling for up to `wait`.
    /// Returns `Ok(None)` if another holder kept it for the whole wait.
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<Lease>, InsightError>;

    async fn release(&self, lease: Lease) -> Result<(), InsightError>;
}

/// Redis `SET NX PX` lease.
pub struct RedisGenerationLock {
    client: RedisClient,
}

impl RedisGenerationLock {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GenerationLock for RedisGenerationLock {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<Lease>, InsightError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let lease = Lease::new(format!("{KEY_PREFIX}{key}"));
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let started = Instant::now();

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&lease.key)
                .arg(&lease.token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;

            if acquired.is_some() {
                debug!("Acquired generation lease {}", lease.key);
                return Ok(Some(lease));
            }

            if started.elapsed() >= wait {
                warn!(
                    "Generation lease {} still held after {}ms",
                    lease.key,
                    wait.as_millis()
                );
                return Ok(None);
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lease: Lease) -> Result<(), InsightError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            warn!(
                "Generation lease {} expired before release; attempt outlived its TTL",
                lease.key
            );
        }
        Ok(())
    }
}
