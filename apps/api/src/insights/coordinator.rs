//! Generation coordinator: decides whether to generate, deduplicates, generates,
//! and records the result.
//!
//! Flow per (user, category) attempt:
//!   registry lookup → attach to in-flight attempt OR spawn a new one →
//!   distributed lease → eligibility → data bundle → fingerprint →
//!   (cached short-circuit | external generation under timeout) →
//!   insight store + cooldown store → release lease.
//!
//! ARCHITECTURAL RULE: the coordinator is the only writer of the cooldown and
//! insight stores. Handlers and background tasks go through it.
//!
//! Attempts run as detached tasks. A caller that goes away (closed SSE stream,
//! dropped request) never aborts an attempt half-way; the attempt commits its full
//! result and later callers observe it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::insights::clock::Clock;
use crate::insights::cooldown::{describe_state, AttemptRecord, CooldownState, CooldownStateStore};
use crate::insights::errors::InsightError;
use crate::insights::fingerprint::{compute_fingerprint, is_meaningful};
use crate::insights::lock::GenerationLock;
use crate::insights::policy::{CategoryPolicy, CategoryPolicyRegistry};
use crate::insights::providers::{DataSnapshotProvider, ExternalInsightGenerator, GeneratedInsight};
use crate::insights::store::InsightStore;
use crate::models::insight::InsightRecord;

/// Extra lease lifetime beyond the generation timeout, covering bundle fetch
/// and persistence.
const LEASE_MARGIN: Duration = Duration::from_secs(30);

/// Tail of the lease reserved for failure bookkeeping after the attempt deadline.
const CLEANUP_BUDGET: Duration = Duration::from_secs(10);

/// Limit on each best-effort cleanup write. Two of these fit in `CLEANUP_BUDGET`.
const CLEANUP_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Evidence items kept per insight.
const MAX_EVIDENCE_ITEMS: usize = 10;

// ────────────────────────────────────────────────────────────────────────────
// Data models
// ────────────────────────────────────────────────────────────────────────────

/// The single result shape of a generation request. Every internal error is
/// folded into one of these variants.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// A fresh insight, or the cached one when the data has not changed.
    Generated { insight: InsightRecord, cached: bool },
    CooldownActive {
        cooldown_until: DateTime<Utc>,
        remaining: chrono::Duration,
    },
    InsufficientData { data_point_count: u32, needed: u32 },
    GenerationFailed { error: String, fallback_insight: String },
    InvalidCategory { category: String },
}

impl GenerationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, GenerationOutcome::Generated { .. })
    }
}

/// Read-only view returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct InsightStatus {
    pub cooldown_status: BTreeMap<String, CooldownState>,
    pub recent_insights: Vec<InsightRecord>,
}

/// One category's slice of the weekly digest.
#[derive(Debug, Clone)]
pub struct DigestEntry {
    pub category: String,
    pub outcome: GenerationOutcome,
    /// The cached active insight, filled when this run did not produce one.
    pub cached_insight: Option<InsightRecord>,
}

#[derive(Debug, Clone)]
pub struct WeeklyDigest {
    pub user_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<DigestEntry>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Per-attempt limit on the external generation call.
    pub generation_timeout: Duration,
    /// How long to wait for another instance's lease before giving up.
    pub lock_wait: Duration,
    /// Default size of the recent-insights list.
    pub recent_limit: usize,
}

/// Everything the coordinator needs. Carried as one struct so the constructor
/// stays readable.
pub struct CoordinatorParts {
    pub registry: CategoryPolicyRegistry,
    pub cooldowns: Arc<dyn CooldownStateStore>,
    pub insights: Arc<dyn InsightStore>,
    pub lock: Arc<dyn GenerationLock>,
    pub snapshots: Arc<dyn DataSnapshotProvider>,
    pub generator: Arc<dyn ExternalInsightGenerator>,
    pub clock: Arc<dyn Clock>,
    pub settings: CoordinatorSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GenerationKey {
    user_id: Uuid,
    category: String,
}

impl fmt::Display for GenerationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.category)
    }
}

type SharedOutcome = Shared<BoxFuture<'static, GenerationOutcome>>;

struct InFlight {
    attempt_id: u64,
    forced: bool,
    outcome: SharedOutcome,
}

/// What a caller waits on after `attach_or_start`.
struct Pending {
    outcome: SharedOutcome,
    /// A forced caller sharing an unforced attempt. If that attempt does not
    /// generate, the caller starts its own forced attempt.
    retry_forced: bool,
}

struct Inner {
    parts: CoordinatorParts,
    in_flight: Mutex<HashMap<GenerationKey, InFlight>>,
    next_attempt_id: AtomicU64,
}

/// Removes the in-flight entry when the attempt task ends, including on panic.
struct InFlightRegistration {
    inner: Arc<Inner>,
    key: GenerationKey,
    attempt_id: u64,
}

impl Drop for InFlightRegistration {
    fn drop(&mut self) {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(&self.key)
            .is_some_and(|entry| entry.attempt_id == self.attempt_id)
        {
            in_flight.remove(&self.key);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Coordinator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GenerationCoordinator {
    inner: Arc<Inner>,
}

impl GenerationCoordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                parts,
                in_flight: Mutex::new(HashMap::new()),
                next_attempt_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &CategoryPolicyRegistry {
        &self.inner.parts.registry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.parts.clock.now()
    }

    /// Generates (or declines to generate) an insight for one category.
    ///
    /// At most one attempt per (user, category) is in flight in this process;
    /// concurrent callers for the same key share its outcome. `force_generate`
    /// skips the cooldown window but never the deduplication or the lease.
    pub async fn generate_category_insight(
        &self,
        user_id: Uuid,
        category: &str,
        force_generate: bool,
    ) -> GenerationOutcome {
        let Some(policy) = self.inner.parts.registry.get(category).cloned() else {
            warn!("Rejected insight request for unknown category '{category}'");
            return GenerationOutcome::InvalidCategory {
                category: category.to_string(),
            };
        };

        let key = GenerationKey {
            user_id,
            category: policy.name.clone(),
        };

        loop {
            let pending = self.attach_or_start(key.clone(), policy.clone(), force_generate);
            let outcome = pending.outcome.await;
            if pending.retry_forced && !outcome.is_success() {
                debug!("Shared attempt for {key} did not generate; running forced attempt");
                continue;
            }
            return outcome;
        }
    }

    /// Per-category gating state plus recent insights. No side effects.
    pub async fn status(&self, user_id: Uuid) -> Result<InsightStatus, InsightError> {
        let parts = &self.inner.parts;
        let now = parts.clock.now();

        let records: HashMap<String, _> = parts
            .cooldowns
            .list_for_user(user_id)
            .await?
            .into_iter()
            .map(|record| (record.category.clone(), record))
            .collect();

        let cooldown_status = parts
            .registry
            .categories()
            .map(|category| {
                let key = GenerationKey {
                    user_id,
                    category: category.to_string(),
                };
                let state = if self.is_in_flight(&key) {
                    CooldownState::Generating
                } else {
                    describe_state(records.get(category), now)
                };
                (category.to_string(), state)
            })
            .collect();

        let recent_insights = parts
            .insights
            .get_recent(user_id, parts.settings.recent_limit, now)
            .await?;

        Ok(InsightStatus {
            cooldown_status,
            recent_insights,
        })
    }

    pub async fn recent_insights(
        &self,
        user_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<InsightRecord>, InsightError> {
        let parts = &self.inner.parts;
        let limit = limit.unwrap_or(parts.settings.recent_limit);
        parts.insights.get_recent(user_id, limit, parts.clock.now()).await
    }

    /// Best-effort, non-forced generation across every category, merged with the
    /// cached insight for categories that did not produce a fresh one.
    pub async fn weekly_digest(&self, user_id: Uuid) -> WeeklyDigest {
        let categories: Vec<String> = self
            .inner
            .parts
            .registry
            .categories()
            .map(str::to_string)
            .collect();

        let outcomes = join_all(
            categories
                .iter()
                .map(|category| self.generate_category_insight(user_id, category, false)),
        )
        .await;

        let mut entries = Vec::with_capacity(categories.len());
        for (category, outcome) in categories.into_iter().zip(outcomes) {
            let cached_insight = if outcome.is_success() {
                None
            } else {
                self.cached_insight(user_id, &category).await
            };
            entries.push(DigestEntry {
                category,
                outcome,
                cached_insight,
            });
        }

        let fresh = entries.iter().filter(|e| e.outcome.is_success()).count();
        info!(
            "Weekly digest for user {}: {}/{} categories produced an insight",
            user_id,
            fresh,
            entries.len()
        );

        WeeklyDigest {
            user_id,
            generated_at: self.inner.parts.clock.now(),
            entries,
        }
    }

    /// Marks the active insight for a category inactive.
    pub async fn invalidate(&self, user_id: Uuid, category: &str) -> Result<bool, InsightError> {
        if self.inner.parts.registry.get(category).is_none() {
            return Err(InsightError::InvalidCategory(category.to_string()));
        }
        let invalidated = self.inner.parts.insights.invalidate(user_id, category).await?;
        if invalidated {
            info!("Invalidated active {category} insight for user {user_id}");
        }
        Ok(invalidated)
    }

    /// Physically deletes expired insights. Correctness never depends on this.
    pub async fn purge_expired(&self) -> Result<u64, InsightError> {
        let parts = &self.inner.parts;
        parts.insights.purge_expired(parts.clock.now()).await
    }

    /// Runs `purge_expired` every `period` until the process exits.
    pub fn spawn_expiry_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match coordinator.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => info!("Purged {n} expired insights"),
                    Err(e) => warn!("Expired insight purge failed: {e}"),
                }
            }
        })
    }

    // ────────────────────────────────────────────────────────────────────────
    // In-flight deduplication
    // ────────────────────────────────────────────────────────────────────────

    fn is_in_flight(&self, key: &GenerationKey) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn attach_or_start(
        &self,
        key: GenerationKey,
        policy: CategoryPolicy,
        force_generate: bool,
    ) -> Pending {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = in_flight.get(&key) {
            debug!("Attaching to in-flight generation {key}");
            return Pending {
                outcome: existing.outcome.clone(),
                retry_forced: force_generate && !existing.forced,
            };
        }

        let attempt_id = self.inner.next_attempt_id.fetch_add(1, Ordering::Relaxed);
        let fallback_insight = policy.fallback_text.clone();
        let registration = InFlightRegistration {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            attempt_id,
        };
        let coordinator = self.clone();

        let handle = tokio::spawn(async move {
            // `registration` is owned by this task and dropped when it ends.
            coordinator
                .run_attempt(&registration.key, &policy, force_generate)
                .await
        });

        let outcome = handle
            .map(move |joined| {
                joined.unwrap_or_else(|e| {
                    error!("Insight generation task aborted: {e}");
                    GenerationOutcome::GenerationFailed {
                        error: "generation task aborted".to_string(),
                        fallback_insight,
                    }
                })
            })
            .boxed()
            .shared();

        in_flight.insert(
            key,
            InFlight {
                attempt_id,
                forced: force_generate,
                outcome: outcome.clone(),
            },
        );
        Pending {
            outcome,
            retry_forced: false,
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // One attempt
    // ────────────────────────────────────────────────────────────────────────

    /// Holds the distributed lease around `attempt` and normalizes its errors.
    async fn run_attempt(
        &self,
        key: &GenerationKey,
        policy: &CategoryPolicy,
        force_generate: bool,
    ) -> GenerationOutcome {
        let parts = &self.inner.parts;
        let lease_ttl = parts.settings.generation_timeout + LEASE_MARGIN;

        let lease = match parts
            .lock
            .acquire(&key.to_string(), lease_ttl, parts.settings.lock_wait)
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => return failed(key, policy, InsightError::LockBusy(key.to_string())),
            Err(e) => return failed(key, policy, e),
        };

        // Every step of the attempt finishes before the lease can expire.
        let deadline = Instant::now() + lease_ttl - CLEANUP_BUDGET;

        let outcome = match self.attempt(key, policy, force_generate, deadline).await {
            Ok(outcome) => outcome,
            Err(e) => failed(key, policy, e),
        };

        if let Err(e) = parts.lock.release(lease).await {
            warn!("Failed to release generation lease for {key}: {e}");
        }

        outcome
    }

    async fn attempt(
        &self,
        key: &GenerationKey,
        policy: &CategoryPolicy,
        force_generate: bool,
        deadline: Instant,
    ) -> Result<GenerationOutcome, InsightError> {
        let parts = &self.inner.parts;
        let now = parts.clock.now();

        // Step 1: Cooldown gate
        let eligibility = within(
            deadline,
            "cooldown lookup",
            parts
                .cooldowns
                .is_eligible(key.user_id, &key.category, force_generate, now),
        )
        .await?;

        if !eligibility.eligible {
            debug!(
                "Cooldown active for {key}: {}s remaining",
                eligibility.remaining.num_seconds()
            );
            return Ok(GenerationOutcome::CooldownActive {
                cooldown_until: now + eligibility.remaining,
                remaining: eligibility.remaining,
            });
        }

        // Step 2: Data bundle
        let bundle = within(
            deadline,
            "snapshot fetch",
            parts.snapshots.get_bundle(key.user_id, &key.category),
        )
        .await?;

        if bundle.data_point_count < policy.min_data_points {
            info!(
                "Insufficient data for {key}: {}/{} data points",
                bundle.data_point_count, policy.min_data_points
            );
            return Ok(GenerationOutcome::InsufficientData {
                data_point_count: bundle.data_point_count,
                needed: policy.min_data_points,
            });
        }

        // Step 3: Fingerprint, and short-circuit when nothing changed
        let fingerprint = compute_fingerprint(&bundle, policy);
        let unchanged = !force_generate
            && is_meaningful(&fingerprint)
            && eligibility
                .state
                .as_ref()
                .and_then(|s| s.last_fingerprint.as_deref())
                == Some(fingerprint.as_str());

        if unchanged {
            let cached = within(
                deadline,
                "cached insight lookup",
                parts.insights.get_active(key.user_id, &key.category, now),
            )
            .await?;
            if let Some(cached) = cached {
                within(
                    deadline,
                    "cooldown update",
                    self.record_attempt(key, policy, &fingerprint, true, now),
                )
                .await?;
                info!("Data unchanged for {key}; serving cached insight {}", cached.id);
                return Ok(GenerationOutcome::Generated {
                    insight: cached,
                    cached: true,
                });
            }
        }

        // Step 4: External generation under the per-attempt timeout
        let timeout = parts.settings.generation_timeout;
        let generation_deadline = (Instant::now() + timeout).min(deadline);
        let generated = match tokio::time::timeout_at(
            generation_deadline,
            parts.generator.generate(&policy.prompt_template_id, &bundle),
        )
        .await
        {
            Ok(Ok(raw)) => validate_generated(raw, policy),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(InsightError::Timeout(timeout)),
        };

        // From here on every failure is counted as a failed attempt.
        let generated = match generated {
            Ok(generated) => generated,
            Err(e) => {
                self.record_failure(key, policy, &fingerprint).await;
                return Ok(failed(key, policy, e));
            }
        };

        // Step 5: Persist the insight, then the cooldown
        let generated_at = parts.clock.now();
        let record = InsightRecord {
            id: Uuid::new_v4(),
            user_id: key.user_id,
            category: key.category.clone(),
            text: generated.text,
            confidence: generated.confidence,
            evidence: generated.evidence,
            data_fingerprint: fingerprint.clone(),
            data_point_count: i32::try_from(bundle.data_point_count).unwrap_or(i32::MAX),
            generated_at,
            expires_at: generated_at + policy.ttl,
            active: true,
        };

        if let Err(e) = within(deadline, "insight save", parts.insights.save(&record)).await {
            self.record_failure(key, policy, &fingerprint).await;
            return Ok(failed(key, policy, e));
        }

        if let Err(e) = within(
            deadline,
            "cooldown update",
            self.record_attempt(key, policy, &fingerprint, true, generated_at),
        )
        .await
        {
            // An insight without its cooldown must not be served.
            self.withdraw(key, &record).await;
            self.record_failure(key, policy, &fingerprint).await;
            return Ok(failed(key, policy, e));
        }

        info!(
            "Generated {} insight {} for user {} (confidence {:.2})",
            key.category, record.id, key.user_id, record.confidence
        );

        Ok(GenerationOutcome::Generated {
            insight: record,
            cached: false,
        })
    }

    /// Best-effort failed-attempt record. Errors are logged, never returned.
    async fn record_failure(&self, key: &GenerationKey, policy: &CategoryPolicy, fingerprint: &str) {
        let now = self.inner.parts.clock.now();
        match tokio::time::timeout(
            CLEANUP_STEP_TIMEOUT,
            self.record_attempt(key, policy, fingerprint, false, now),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Could not record failed attempt for {key}: {e}"),
            Err(_) => warn!("Recording failed attempt for {key} timed out"),
        }
    }

    /// Deactivates a just-saved insight whose cooldown could not be written.
    async fn withdraw(&self, key: &GenerationKey, record: &InsightRecord) {
        match tokio::time::timeout(
            CLEANUP_STEP_TIMEOUT,
            self.inner.parts.insights.invalidate(key.user_id, &key.category),
        )
        .await
        {
            Ok(Ok(_)) => warn!("Withdrew insight {} for {key}: cooldown not recorded", record.id),
            Ok(Err(e)) => error!("Could not withdraw insight {} for {key}: {e}", record.id),
            Err(_) => error!("Withdrawing insight {} for {key} timed out", record.id),
        }
    }

    async fn record_attempt(
        &self,
        key: &GenerationKey,
        policy: &CategoryPolicy,
        fingerprint: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<(), InsightError> {
        self.inner
            .parts
            .cooldowns
            .record_attempt(AttemptRecord {
                user_id: key.user_id,
                category: &key.category,
                fingerprint,
                success,
                now,
                cooldown_period: policy.cooldown_period,
            })
            .await
    }

    async fn cached_insight(&self, user_id: Uuid, category: &str) -> Option<InsightRecord> {
        let parts = &self.inner.parts;
        match parts
            .insights
            .get_active(user_id, category, parts.clock.now())
            .await
        {
            Ok(insight) => insight,
            Err(e) => {
                warn!("Could not load cached {category} insight for user {user_id}: {e}");
                None
            }
        }
    }
}

/// Runs one store step, failing it if it would outlive the attempt deadline.
async fn within<T>(
    deadline: Instant,
    step: &'static str,
    fut: impl Future<Output = Result<T, InsightError>>,
) -> Result<T, InsightError> {
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| InsightError::Deadline(step))?
}

fn failed(key: &GenerationKey, policy: &CategoryPolicy, error: InsightError) -> GenerationOutcome {
    error!("Insight generation failed for {key}: {error}");
    GenerationOutcome::GenerationFailed {
        error: error.to_string(),
        fallback_insight: policy.fallback_text.clone(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Output validation
// ────────────────────────────────────────────────────────────────────────────

/// Rejects empty text and non-finite confidence; clamps confidence to [0, 1];
/// truncates text to the category limit; drops blank evidence.
fn validate_generated(
    raw: GeneratedInsight,
    policy: &CategoryPolicy,
) -> Result<GeneratedInsight, InsightError> {
    let text = raw.text.trim();
    if text.is_empty() {
        return Err(InsightError::Generation(
            "generator returned empty text".to_string(),
        ));
    }
    if !raw.confidence.is_finite() {
        return Err(InsightError::Generation(format!(
            "generator returned invalid confidence {}",
            raw.confidence
        )));
    }

    let evidence = raw
        .evidence
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .take(MAX_EVIDENCE_ITEMS)
        .collect();

    Ok(GeneratedInsight {
        text: truncate_text(text, policy.text_max_length),
        confidence: raw.confidence.clamp(0.0, 1.0),
        evidence,
    })
}

/// Truncates to at most `max_chars` characters, preferring a word boundary near
/// the end and marking the cut with an ellipsis.
fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let budget = max_chars.saturating_sub(1);
    let cut: String = text.chars().take(budget).collect();
    let trimmed = match cut.rfind(char::is_whitespace) {
        Some(idx) if cut[..idx].chars().count() >= budget * 4 / 5 => cut[..idx].trim_end(),
        _ => cut.trim_end(),
    };

    format!("{trimmed}…")
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
