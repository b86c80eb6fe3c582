//! In-memory doubles for the coordinator's collaborators. Test builds only.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::insights::clock::Clock;
use crate::insights::coordinator::{CoordinatorParts, CoordinatorSettings, GenerationCoordinator};
use crate::insights::cooldown::{AttemptRecord, CooldownStateStore};
use crate::insights::errors::InsightError;
use crate::insights::lock::{GenerationLock, Lease};
use crate::insights::policy::CategoryPolicyRegistry;
use crate::insights::providers::{DataBundle, DataSnapshotProvider, ExternalInsightGenerator, GeneratedInsight};
use crate::insights::store::InsightStore;
use crate::models::insight::{CooldownRecord, InsightRecord};

// ────────────────────────────────────────────────────────────────────────────
// Clock
// ────────────────────────────────────────────────────────────────────────────

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stores
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCooldownStore {
    records: Mutex<HashMap<(Uuid, String), CooldownRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryCooldownStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn state(&self, user_id: Uuid, category: &str) -> Option<CooldownRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&(user_id, category.to_string()))
            .cloned()
    }
}

#[async_trait]
impl CooldownStateStore for MemoryCooldownStore {
    async fn get_state(
        &self,
        user_id: Uuid,
        category: &str,
    ) -> Result<Option<CooldownRecord>, InsightError> {
        Ok(self.state(user_id, category))
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<CooldownRecord>, InsightError> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.category.cmp(&b.category));
        Ok(records)
    }

    async fn record_attempt(&self, attempt: AttemptRecord<'_>) -> Result<(), InsightError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(InsightError::Persistence(sqlx::Error::PoolTimedOut));
        }
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry((attempt.user_id, attempt.category.to_string()))
            .or_insert_with(|| CooldownRecord {
                user_id: attempt.user_id,
                category: attempt.category.to_string(),
                last_generated_at: None,
                cooldown_until: None,
                last_fingerprint: None,
                attempt_count: 0,
            });

        record.attempt_count += 1;
        if attempt.success {
            record.last_generated_at = Some(attempt.now);
            record.cooldown_until = Some(attempt.now + attempt.cooldown_period);
            record.last_fingerprint = Some(attempt.fingerprint.to_string());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryInsightStore {
    records: Mutex<Vec<InsightRecord>>,
    fail_saves: AtomicBool,
}

impl MemoryInsightStore {
    /// Every stored record, expired or not.
    pub fn all(&self) -> Vec<InsightRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl InsightStore for MemoryInsightStore {
    async fn save(&self, record: &InsightRecord) -> Result<(), InsightError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(InsightError::Persistence(sqlx::Error::PoolTimedOut));
        }
        let mut records = self.records.lock().unwrap();
        for existing in records
            .iter_mut()
            .filter(|r| r.user_id == record.user_id && r.category == record.category)
        {
            existing.active = false;
        }
        records.push(record.clone());
        Ok(())
    }

    async fn get_active(
        &self,
        user_id: Uuid,
        category: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<InsightRecord>, InsightError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id && r.category == category)
            .filter(|r| r.active && r.expires_at > now)
            .max_by_key(|r| r.generated_at)
            .cloned())
    }

    async fn get_recent(
        &self,
        user_id: Uuid,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<InsightRecord>, InsightError> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id && r.expires_at > now)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn invalidate(&self, user_id: Uuid, category: &str) -> Result<bool, InsightError> {
        let mut found = false;
        for record in self
            .records
            .lock()
            .unwrap()
            .iter_mut()
            .filter(|r| r.user_id == user_id && r.category == category && r.active)
        {
            record.active = false;
            found = true;
        }
        Ok(found)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, InsightError> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| r.expires_at > now);
        Ok((before - records.len()) as u64)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Lock
// ────────────────────────────────────────────────────────────────────────────

/// Never waits: a held key is reported busy immediately.
#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashSet<String>>,
}

impl MemoryLock {
    /// Simulates another instance holding the lease.
    pub fn hold(&self, key: &str) {
        self.held.lock().unwrap().insert(key.to_string());
    }

    pub fn held_keys(&self) -> Vec<String> {
        self.held.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl GenerationLock for MemoryLock {
    async fn acquire(
        &self,
        key: &str,
        _ttl: Duration,
        _wait: Duration,
    ) -> Result<Option<Lease>, InsightError> {
        let mut held = self.held.lock().unwrap();
        if !held.insert(key.to_string()) {
            return Ok(None);
        }
        Ok(Some(Lease::new(key)))
    }

    async fn release(&self, lease: Lease) -> Result<(), InsightError> {
        self.held.lock().unwrap().remove(&lease.key);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Collaborators
// ────────────────────────────────────────────────────────────────────────────

pub fn default_bundle_json() -> Value {
    json!({
        "data_point_count": 24,
        "patterns": ["late_nights", "short_replies"],
        "mood_confidence": 0.7
    })
}

pub struct StubSnapshots {
    bundle: Mutex<DataBundle>,
    calls: AtomicUsize,
    stalled: AtomicBool,
}

impl StubSnapshots {
    pub fn new() -> Self {
        let stub = Self {
            bundle: Mutex::new(DataBundle::default()),
            calls: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
        };
        stub.set(default_bundle_json());
        stub
    }

    pub fn set(&self, bundle: Value) {
        *self.bundle.lock().unwrap() = serde_json::from_value(bundle).unwrap();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Makes every later `get_bundle` call hang, like a stalled database.
    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataSnapshotProvider for StubSnapshots {
    async fn get_bundle(&self, _user_id: Uuid, _category: &str) -> Result<DataBundle, InsightError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.bundle.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone)]
pub enum StubBehavior {
    Reply {
        text: String,
        confidence: f64,
        delay: Duration,
    },
    Fail(String),
    /// Never returns; exercises the coordinator's timeout.
    Hang,
}

impl StubBehavior {
    pub fn reply() -> Self {
        Self::reply_after(Duration::ZERO)
    }

    pub fn reply_after(delay: Duration) -> Self {
        StubBehavior::Reply {
            text: "You tend to open up more in late-evening conversations.".to_string(),
            confidence: 0.72,
            delay,
        }
    }
}

pub struct StubGenerator {
    behavior: Mutex<StubBehavior>,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl StubGenerator {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(StubBehavior::reply()),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, behavior: StubBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of generate calls observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExternalInsightGenerator for StubGenerator {
    async fn generate(
        &self,
        _prompt_template_id: &str,
        _bundle: &DataBundle,
    ) -> Result<GeneratedInsight, InsightError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            StubBehavior::Reply {
                text,
                confidence,
                delay,
            } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(GeneratedInsight {
                    text,
                    confidence,
                    evidence: vec!["late_nights".to_string()],
                })
            }
            StubBehavior::Fail(message) => Err(InsightError::Generation(message)),
            StubBehavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Harness
// ────────────────────────────────────────────────────────────────────────────

pub struct Harness {
    pub coordinator: GenerationCoordinator,
    pub clock: Arc<ManualClock>,
    pub cooldowns: Arc<MemoryCooldownStore>,
    pub insights: Arc<MemoryInsightStore>,
    pub lock: Arc<MemoryLock>,
    pub snapshots: Arc<StubSnapshots>,
    pub generator: Arc<StubGenerator>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let cooldowns = Arc::new(MemoryCooldownStore::default());
        let insights = Arc::new(MemoryInsightStore::default());
        let lock = Arc::new(MemoryLock::default());
        let snapshots = Arc::new(StubSnapshots::new());
        let generator = Arc::new(StubGenerator::new());

        let coordinator = GenerationCoordinator::new(CoordinatorParts {
            registry: CategoryPolicyRegistry::builtin().unwrap(),
            cooldowns: cooldowns.clone(),
            insights: insights.clone(),
            lock: lock.clone(),
            snapshots: snapshots.clone(),
            generator: generator.clone(),
            clock: clock.clone(),
            settings: CoordinatorSettings {
                generation_timeout: Duration::from_secs(30),
                lock_wait: Duration::ZERO,
                recent_limit: 10,
            },
        });

        Self {
            coordinator,
            clock,
            cooldowns,
            insights,
            lock,
            snapshots,
            generator,
        }
    }
}
