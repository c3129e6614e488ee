//! Conversation deduplication engine.
//!
//! Threads are grouped by `(tenant_id, canonical phone)`. In each group with
//! more than one thread a survivor is elected, the other threads' messages
//! are moved onto it and the emptied threads are deleted.
//!
//! Survivor policy: most messages, then earliest `created_at`, then the
//! smallest id.

use bharat_core::error::{CrmError, Result};
use bharat_core::types::{ConversationThread, DedupSummary, Direction, Message};
use bharat_core::Clock;
use bharat_db::{CrmDb, MergeOutcome, NewThread};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::phone::{PhoneKey, phone_key};

/// Dedup pass trigger names stored with each run.
pub const TRIGGER_SCHEDULED: &str = "scheduled";
pub const TRIGGER_OPERATOR: &str = "operator";
pub const TRIGGER_INCREMENTAL: &str = "incremental";

/// Reconciles duplicate conversation threads.
#[derive(Clone)]
pub struct DedupEngine {
    db: Arc<CrmDb>,
    clock: Arc<dyn Clock>,
    default_country: String,
}

/// Pick the survivor from `(thread, message_count)` candidates.
pub fn elect_survivor(candidates: &[(ConversationThread, u64)]) -> Option<&ConversationThread> {
    candidates
        .iter()
        .min_by(|(a, a_count), (b, b_count)| {
            b_count
                .cmp(a_count)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|(thread, _)| thread)
}

fn needs_backfill(thread: &ConversationThread, key: &PhoneKey) -> bool {
    thread.canonical_phone != key.key
        || thread.country_code != key.country_code
        || thread.phone_normalized != key.normalized
}

impl DedupEngine {
    /// `default_country` is the fallback hint for tenants without their own.
    pub fn new(db: Arc<CrmDb>, clock: Arc<dyn Clock>, default_country: impl Into<String>) -> Self {
        Self {
            db,
            clock,
            default_country: default_country.into(),
        }
    }

    fn tenant_hints(&self) -> Result<HashMap<String, String>> {
        Ok(self
            .db
            .list_tenants()?
            .into_iter()
            .filter_map(|t| t.default_country.map(|c| (t.id, c)))
            .collect())
    }

    fn hint_for(&self, tenant_id: &str) -> Result<String> {
        match self.db.get_tenant(tenant_id) {
            Ok(t) => Ok(t.default_country.unwrap_or_else(|| self.default_country.clone())),
            Err(CrmError::NotFound(_)) => Ok(self.default_country.clone()),
            Err(e) => Err(e),
        }
    }

    /// Full pass over every thread (or one tenant's).
    pub async fn reconcile_all(&self, tenant_id: Option<&str>, trigger: &str) -> Result<DedupSummary> {
        self.reconcile_all_with(tenant_id, trigger, || std::future::ready(Ok(())))
            .await
    }

    /// Full pass. `checkpoint` is awaited before every write. A scheduled
    /// pass confirms its lease there and yields to the runtime, so lease
    /// loss and shutdown stop it between groups.
    pub async fn reconcile_all_with<F, Fut>(
        &self,
        tenant_id: Option<&str>,
        trigger: &str,
        mut checkpoint: F,
    ) -> Result<DedupSummary>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let started = self.clock.now();
        let hints = self.tenant_hints()?;
        let threads = self.db.list_threads(tenant_id)?;

        let mut summary = DedupSummary {
            threads_examined: threads.len() as u64,
            ..Default::default()
        };

        let mut groups: BTreeMap<(String, String), Vec<ConversationThread>> = BTreeMap::new();
        for mut thread in threads {
            let hint = hints.get(&thread.tenant_id).unwrap_or(&self.default_country);
            let key = phone_key(&thread.raw_phone, hint);
            if needs_backfill(&thread, &key) {
                checkpoint().await?;
                if self.backfill(&mut thread, &key)? {
                    summary.canonical_backfilled += 1;
                }
            }
            groups
                .entry((thread.tenant_id.clone(), thread.canonical_phone.clone()))
                .or_default()
                .push(thread);
        }

        for ((tenant, phone), group) in groups {
            if group.len() < 2 {
                continue;
            }
            checkpoint().await?;
            summary.duplicate_groups += 1;
            summary.duplicates_found += group.len() as u64 - 1;
            match self.merge_group(&group) {
                Ok(merged) => summary.absorb(&merged),
                Err(e) => {
                    tracing::warn!("⚠️ Dedup group {tenant}/{phone} failed, left for next run: {e}");
                    summary.groups_failed += 1;
                }
            }
        }

        let finished = self.clock.now();
        self.db.record_dedup_run(trigger, started, finished, &summary)?;
        if summary.is_noop() && summary.groups_failed == 0 {
            tracing::debug!("🧹 Dedup ({trigger}): nothing to do, {} threads examined", summary.threads_examined);
        } else {
            tracing::info!("🧹 Dedup ({trigger}): {summary}");
        }
        Ok(summary)
    }

    /// Reconcile only the threads that share `raw_phone`'s key within one
    /// tenant. Stored only when it changed something.
    pub fn reconcile_phone(&self, tenant_id: &str, raw_phone: &str) -> Result<DedupSummary> {
        let started = self.clock.now();
        let hint = self.hint_for(tenant_id)?;
        let target = phone_key(raw_phone, &hint);

        let mut summary = DedupSummary::default();
        let mut group = Vec::new();
        for mut thread in self.db.list_threads(Some(tenant_id))? {
            let key = phone_key(&thread.raw_phone, &hint);
            if key.key != target.key && thread.canonical_phone != target.key {
                continue;
            }
            summary.threads_examined += 1;
            if self.backfill(&mut thread, &key)? {
                summary.canonical_backfilled += 1;
            }
            if thread.canonical_phone == target.key {
                group.push(thread);
            }
        }

        if group.len() > 1 {
            summary.duplicate_groups = 1;
            summary.duplicates_found = group.len() as u64 - 1;
            match self.merge_group(&group) {
                Ok(merged) => summary.absorb(&merged),
                Err(e) => {
                    tracing::warn!("⚠️ Dedup {tenant_id}/{} failed, left for next run: {e}", target.key);
                    summary.groups_failed = 1;
                }
            }
        }

        if !summary.is_noop() || summary.groups_failed > 0 {
            self.db
                .record_dedup_run(TRIGGER_INCREMENTAL, started, self.clock.now(), &summary)?;
            tracing::info!("🧹 Dedup ({TRIGGER_INCREMENTAL}) {tenant_id}/{}: {summary}", target.key);
        }
        Ok(summary)
    }

    /// Thread for an incoming contact, creating one if the tenant has none
    /// for this number. Existing duplicates are merged first.
    pub fn find_or_create_thread(
        &self,
        tenant_id: &str,
        owner_user_id: Option<&str>,
        raw_phone: &str,
    ) -> Result<ConversationThread> {
        let hint = self.hint_for(tenant_id)?;
        let key = phone_key(raw_phone, &hint);

        let mut existing = self.db.threads_for_phone(tenant_id, &key.key)?;
        if existing.len() > 1 {
            self.reconcile_phone(tenant_id, raw_phone)?;
            existing = self.db.threads_for_phone(tenant_id, &key.key)?;
        }
        if let Some(thread) = existing.into_iter().next() {
            return Ok(thread);
        }

        let thread = self.db.insert_thread(
            &NewThread {
                tenant_id,
                owner_user_id,
                raw_phone,
                canonical_phone: &key.key,
                country_code: key.country_code.as_deref(),
                phone_normalized: key.normalized,
            },
            self.clock.now(),
        )?;
        tracing::debug!("💬 New thread {} for {tenant_id}/{}", thread.id, key.key);
        Ok(thread)
    }

    /// Ingest one message for `raw_phone`, creating the thread if needed.
    /// A repeated `external_message_id` in the same thread is a `Conflict`.
    pub fn record_message(
        &self,
        tenant_id: &str,
        raw_phone: &str,
        external_message_id: Option<&str>,
        direction: Direction,
        body: &str,
    ) -> Result<Message> {
        let thread = self.find_or_create_thread(tenant_id, None, raw_phone)?;
        self.db
            .insert_message(&thread.id, external_message_id, direction, body, self.clock.now())
    }

    /// Bring the stored phone columns in line with `key`. Returns whether
    /// the row was updated.
    fn backfill(&self, thread: &mut ConversationThread, key: &PhoneKey) -> Result<bool> {
        if !needs_backfill(thread, key) {
            return Ok(false);
        }
        let updated = self.db.update_thread_phone(
            &thread.id,
            &thread.canonical_phone,
            &key.key,
            key.country_code.as_deref(),
            key.normalized,
        )?;
        if updated {
            thread.canonical_phone = key.key.clone();
            thread.country_code = key.country_code.clone();
            thread.phone_normalized = key.normalized;
        }
        Ok(updated)
    }

    fn merge_group(&self, group: &[ConversationThread]) -> Result<DedupSummary> {
        let mut candidates = Vec::with_capacity(group.len());
        for thread in group {
            let count = self.db.message_count(&thread.id)?;
            candidates.push((thread.clone(), count));
        }
        let survivor = elect_survivor(&candidates)
            .ok_or_else(|| CrmError::Conflict("empty duplicate group".into()))?
            .clone();

        let mut losers = Vec::with_capacity(candidates.len() - 1);
        for (thread, count) in &candidates {
            if thread.id == survivor.id {
                continue;
            }
            tracing::warn!(
                "🗑️ Merging thread {} (raw phone '{}', {} messages, created {}) into {} for {}",
                thread.id,
                thread.raw_phone,
                count,
                thread.created_at,
                survivor.id,
                survivor.canonical_phone
            );
            losers.push(thread.id.clone());
        }

        let MergeOutcome {
            messages_moved,
            messages_skipped,
            conflicts,
            threads_deleted,
            threads_retained,
        } = self.db.merge_threads(&survivor.id, &losers, self.clock.now())?;
        if conflicts > 0 {
            tracing::warn!(
                "⚠️ {conflicts} message(s) flagged for review; {threads_retained} thread(s) kept for {}",
                survivor.canonical_phone
            );
        }

        Ok(DedupSummary {
            messages_moved,
            messages_skipped,
            threads_deleted,
            ..Default::default()
        })
    }
}
