//! Conversation threads, messages and the transactional merge used by the
//! deduplication engine.

use bharat_core::error::{CrmError, Result};
use bharat_core::types::{ConversationThread, DedupRun, DedupSummary, Direction, Message};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params};

use crate::{CrmDb, get_enum, get_opt_ts, get_ts, is_constraint_violation, new_id, ts};

/// Fields for a new thread. The phone fields come from the normalizer.
#[derive(Debug, Clone)]
pub struct NewThread<'a> {
    pub tenant_id: &'a str,
    pub owner_user_id: Option<&'a str>,
    pub raw_phone: &'a str,
    pub canonical_phone: &'a str,
    pub country_code: Option<&'a str>,
    pub phone_normalized: bool,
}

/// What one merge transaction did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub messages_moved: u64,
    /// Duplicates by external id plus conflicting moves.
    pub messages_skipped: u64,
    pub conflicts: u64,
    pub threads_deleted: u64,
    /// Losers kept because a move conflicted; retried on the next pass.
    pub threads_retained: u64,
}

const THREAD_SELECT: &str = "SELECT id, tenant_id, owner_user_id, raw_phone, canonical_phone, country_code, phone_normalized, last_message_at, created_at FROM conversation_threads";

fn row_to_thread(row: &rusqlite::Row) -> rusqlite::Result<ConversationThread> {
    Ok(ConversationThread {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        owner_user_id: row.get(2)?,
        raw_phone: row.get(3)?,
        canonical_phone: row.get(4)?,
        country_code: row.get(5)?,
        phone_normalized: row.get::<_, i32>(6)? != 0,
        last_message_at: get_opt_ts(row, 7)?,
        created_at: get_ts(row, 8)?,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        external_message_id: row.get(2)?,
        direction: get_enum::<Direction>(row, 3)?,
        body: row.get(4)?,
        created_at: get_ts(row, 5)?,
    })
}

impl CrmDb {
    // ── Threads ────────────────────────────────────

    /// Insert a thread.
    pub fn insert_thread(&self, new: &NewThread<'_>, now: DateTime<Utc>) -> Result<ConversationThread> {
        let id = new_id();
        self.conn()
            .execute(
                "INSERT INTO conversation_threads
                 (id, tenant_id, owner_user_id, raw_phone, canonical_phone, country_code, phone_normalized, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    new.tenant_id,
                    new.owner_user_id,
                    new.raw_phone,
                    new.canonical_phone,
                    new.country_code,
                    new.phone_normalized as i32,
                    ts(&now),
                ],
            )
            .map_err(|e| CrmError::store(format!("Insert thread: {e}")))?;
        self.get_thread(&id)?
            .ok_or_else(|| CrmError::NotFound(format!("thread {id}")))
    }

    /// Get a thread by ID.
    pub fn get_thread(&self, id: &str) -> Result<Option<ConversationThread>> {
        self.conn()
            .query_row(&format!("{THREAD_SELECT} WHERE id = ?1"), params![id], row_to_thread)
            .optional()
            .map_err(|e| CrmError::store(format!("Get thread: {e}")))
    }

    /// All threads, optionally for one tenant, oldest first.
    pub fn list_threads(&self, tenant_id: Option<&str>) -> Result<Vec<ConversationThread>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{THREAD_SELECT} WHERE (?1 IS NULL OR tenant_id = ?1) ORDER BY created_at, id"
            ))
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let threads = stmt
            .query_map(params![tenant_id], row_to_thread)
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read thread: {e}")))?;
        Ok(threads)
    }

    /// Threads sharing one (tenant, canonical phone) key.
    pub fn threads_for_phone(&self, tenant_id: &str, canonical_phone: &str) -> Result<Vec<ConversationThread>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{THREAD_SELECT} WHERE tenant_id = ?1 AND canonical_phone = ?2 ORDER BY created_at, id"
            ))
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let threads = stmt
            .query_map(params![tenant_id, canonical_phone], row_to_thread)
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read thread: {e}")))?;
        Ok(threads)
    }

    /// Backfill the derived phone columns. Conditional on the canonical
    /// value the caller read, so a concurrent backfill is not overwritten.
    pub fn update_thread_phone(
        &self,
        id: &str,
        expected_canonical: &str,
        canonical_phone: &str,
        country_code: Option<&str>,
        phone_normalized: bool,
    ) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE conversation_threads
                 SET canonical_phone = ?1, country_code = ?2, phone_normalized = ?3
                 WHERE id = ?4 AND canonical_phone = ?5",
                params![canonical_phone, country_code, phone_normalized as i32, id, expected_canonical],
            )
            .map_err(|e| CrmError::store(format!("Backfill phone: {e}")))?;
        Ok(changed == 1)
    }

    // ── Messages ────────────────────────────────────

    /// Append a message and bump the thread's `last_message_at`.
    pub fn insert_message(
        &self,
        thread_id: &str,
        external_message_id: Option<&str>,
        direction: Direction,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Message> {
        let id = new_id();
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(|e| CrmError::store(format!("Begin: {e}")))?;
        tx.execute(
            "INSERT INTO messages (id, thread_id, external_message_id, direction, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, thread_id, external_message_id, direction.as_str(), body, ts(&created_at)],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                CrmError::Conflict(format!("message {external_message_id:?} already in thread {thread_id}"))
            } else {
                CrmError::store(format!("Insert message: {e}"))
            }
        })?;
        tx.execute(
            "UPDATE conversation_threads
             SET last_message_at = CASE WHEN last_message_at IS NULL OR last_message_at < ?1 THEN ?1 ELSE last_message_at END
             WHERE id = ?2",
            params![ts(&created_at), thread_id],
        )
        .map_err(|e| CrmError::store(format!("Bump last_message_at: {e}")))?;
        tx.commit().map_err(|e| CrmError::store(format!("Commit: {e}")))?;

        Ok(Message {
            id,
            thread_id: thread_id.to_string(),
            external_message_id: external_message_id.map(str::to_string),
            direction,
            body: body.to_string(),
            created_at,
        })
    }

    /// Messages of a thread in arrival order.
    pub fn list_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, thread_id, external_message_id, direction, body, created_at
                 FROM messages WHERE thread_id = ?1 ORDER BY created_at, id",
            )
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let messages = stmt
            .query_map(params![thread_id], row_to_message)
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read message: {e}")))?;
        Ok(messages)
    }

    /// Number of messages in a thread.
    pub fn message_count(&self, thread_id: &str) -> Result<u64> {
        self.conn()
            .query_row(
                "SELECT count(*) FROM messages WHERE thread_id = ?1",
                params![thread_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(|e| CrmError::store(format!("Count messages: {e}")))
    }

    // ── Merge ────────────────────────────────────

    /// Absorb `losers` into `survivor_id` in one write transaction.
    ///
    /// Messages whose external id already exists under the survivor are
    /// skipped and cascade-deleted with their thread. A move that still
    /// violates uniqueness is recorded in `merge_conflicts` and its loser
    /// thread is kept for the next pass.
    pub fn merge_threads(&self, survivor_id: &str, losers: &[String], now: DateTime<Utc>) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome::default();
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| CrmError::store(format!("Begin merge: {e}")))?;

        let survivor_exists: bool = tx
            .query_row(
                "SELECT count(*) FROM conversation_threads WHERE id = ?1",
                params![survivor_id],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|e| CrmError::store(format!("Check survivor: {e}")))?
            > 0;
        if !survivor_exists {
            return Err(CrmError::Conflict(format!("survivor {survivor_id} no longer exists")));
        }

        for loser in losers {
            if loser == survivor_id {
                continue;
            }
            let pending: Vec<(String, Option<String>)> = {
                let mut stmt = tx
                    .prepare("SELECT id, external_message_id FROM messages WHERE thread_id = ?1 ORDER BY created_at, id")
                    .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
                stmt.query_map(params![loser], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(|e| CrmError::store(format!("Query: {e}")))?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| CrmError::store(format!("Read message: {e}")))?
            };

            let mut conflicted = false;
            for (message_id, external_id) in pending {
                if let Some(ext) = &external_id {
                    let duplicate: i64 = tx
                        .query_row(
                            "SELECT count(*) FROM messages WHERE thread_id = ?1 AND external_message_id = ?2",
                            params![survivor_id, ext],
                            |row| row.get(0),
                        )
                        .map_err(|e| CrmError::store(format!("Check duplicate: {e}")))?;
                    if duplicate > 0 {
                        outcome.messages_skipped += 1;
                        continue;
                    }
                }

                match tx.execute(
                    "UPDATE messages SET thread_id = ?1 WHERE id = ?2 AND thread_id = ?3",
                    params![survivor_id, message_id, loser],
                ) {
                    Ok(n) => outcome.messages_moved += n as u64,
                    Err(e) if is_constraint_violation(&e) => {
                        tracing::warn!(
                            "⚠️ Merge conflict moving message {} from {} to {}: {e}",
                            message_id, loser, survivor_id
                        );
                        tx.execute(
                            "INSERT INTO merge_conflicts (survivor_id, thread_id, message_id, reason, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            params![survivor_id, loser, message_id, e.to_string(), ts(&now)],
                        )
                        .map_err(|e| CrmError::store(format!("Record conflict: {e}")))?;
                        outcome.messages_skipped += 1;
                        outcome.conflicts += 1;
                        conflicted = true;
                    }
                    Err(e) => return Err(CrmError::store(format!("Move message: {e}"))),
                }
            }

            if conflicted {
                outcome.threads_retained += 1;
                continue;
            }
            // Remaining rows (skipped duplicates) go with the thread.
            let deleted = tx
                .execute("DELETE FROM conversation_threads WHERE id = ?1", params![loser])
                .map_err(|e| CrmError::store(format!("Delete thread: {e}")))?;
            outcome.threads_deleted += deleted as u64;
        }

        tx.execute(
            "UPDATE conversation_threads
             SET last_message_at = (SELECT max(created_at) FROM messages WHERE thread_id = ?1)
             WHERE id = ?1",
            params![survivor_id],
        )
        .map_err(|e| CrmError::store(format!("Refresh last_message_at: {e}")))?;

        tx.commit().map_err(|e| CrmError::store(format!("Commit merge: {e}")))?;
        Ok(outcome)
    }

    /// Count unresolved merge conflicts.
    pub fn merge_conflict_count(&self) -> Result<u64> {
        self.conn()
            .query_row("SELECT count(*) FROM merge_conflicts", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(|e| CrmError::store(format!("Count conflicts: {e}")))
    }

    // ── Dedup runs ────────────────────────────────────

    /// Store one dedup pass summary.
    pub fn record_dedup_run(
        &self,
        trigger: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        s: &DedupSummary,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO dedup_runs (trigger, started_at, finished_at, threads_examined, canonical_backfilled,
              duplicate_groups, duplicates_found, messages_moved, messages_skipped, threads_deleted, groups_failed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trigger,
                ts(&started_at),
                ts(&finished_at),
                s.threads_examined as i64,
                s.canonical_backfilled as i64,
                s.duplicate_groups as i64,
                s.duplicates_found as i64,
                s.messages_moved as i64,
                s.messages_skipped as i64,
                s.threads_deleted as i64,
                s.groups_failed as i64,
            ],
        )
        .map_err(|e| CrmError::store(format!("Record dedup run: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent dedup passes, newest first.
    pub fn recent_dedup_runs(&self, limit: usize) -> Result<Vec<DedupRun>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, trigger, started_at, finished_at, threads_examined, canonical_backfilled,
                        duplicate_groups, duplicates_found, messages_moved, messages_skipped,
                        threads_deleted, groups_failed
                 FROM dedup_runs ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let runs = stmt
            .query_map(params![limit as i64], |row| {
                let n = |i: usize| row.get::<_, i64>(i).map(|v| v as u64);
                Ok(DedupRun {
                    id: row.get(0)?,
                    trigger: row.get(1)?,
                    started_at: get_ts(row, 2)?,
                    finished_at: get_ts(row, 3)?,
                    summary: DedupSummary {
                        threads_examined: n(4)?,
                        canonical_backfilled: n(5)?,
                        duplicate_groups: n(6)?,
                        duplicates_found: n(7)?,
                        messages_moved: n(8)?,
                        messages_skipped: n(9)?,
                        threads_deleted: n(10)?,
                        groups_failed: n(11)?,
                    },
                })
            })
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read dedup run: {e}")))?;
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use chrono::Duration;

    fn thread(db: &CrmDb, raw: &str, canonical: &str, at: DateTime<Utc>) -> ConversationThread {
        db.insert_thread(
            &NewThread {
                tenant_id: "t1",
                owner_user_id: Some("u1"),
                raw_phone: raw,
                canonical_phone: canonical,
                country_code: Some("+91"),
                phone_normalized: true,
            },
            at,
        )
        .unwrap()
    }

    #[test]
    fn test_insert_message_bumps_last_message_at() {
        let db = temp_db();
        let th = thread(&db, "9876543210", "+919876543210", t0());
        db.insert_message(&th.id, Some("wamid.1"), Direction::Inbound, "hi", t0() + Duration::minutes(5))
            .unwrap();
        db.insert_message(&th.id, None, Direction::Outbound, "hello", t0() + Duration::minutes(2))
            .unwrap();

        let th = db.get_thread(&th.id).unwrap().unwrap();
        assert_eq!(th.last_message_at, Some(t0() + Duration::minutes(5)));
        assert_eq!(db.message_count(&th.id).unwrap(), 2);
    }

    #[test]
    fn test_duplicate_external_id_in_thread_is_conflict() {
        let db = temp_db();
        let th = thread(&db, "9876543210", "+919876543210", t0());
        db.insert_message(&th.id, Some("wamid.1"), Direction::Inbound, "a", t0()).unwrap();
        let err = db
            .insert_message(&th.id, Some("wamid.1"), Direction::Inbound, "a", t0())
            .unwrap_err();
        assert!(matches!(err, CrmError::Conflict(_)));
    }

    #[test]
    fn test_merge_moves_and_skips() {
        let db = temp_db();
        let survivor = thread(&db, "+919876543210", "+919876543210", t0());
        let loser = thread(&db, "9876543210", "+919876543210", t0() + Duration::hours(1));
        db.insert_message(&survivor.id, Some("m1"), Direction::Inbound, "a", t0()).unwrap();
        db.insert_message(&loser.id, Some("m1"), Direction::Inbound, "a", t0()).unwrap();
        db.insert_message(&loser.id, Some("m2"), Direction::Inbound, "b", t0() + Duration::hours(2))
            .unwrap();
        db.insert_message(&loser.id, None, Direction::Outbound, "c", t0() + Duration::hours(3))
            .unwrap();

        let out = db
            .merge_threads(&survivor.id, &[loser.id.clone()], t0() + Duration::days(1))
            .unwrap();
        assert_eq!(out.messages_moved, 2);
        assert_eq!(out.messages_skipped, 1);
        assert_eq!(out.threads_deleted, 1);
        assert!(db.get_thread(&loser.id).unwrap().is_none());
        assert!(db.list_messages(&loser.id).unwrap().is_empty());

        let merged = db.get_thread(&survivor.id).unwrap().unwrap();
        assert_eq!(merged.last_message_at, Some(t0() + Duration::hours(3)));
        assert_eq!(db.message_count(&survivor.id).unwrap(), 3);
    }

    #[test]
    fn test_merge_conflict_flags_message_and_keeps_thread() {
        let db = temp_db();
        let survivor = thread(&db, "+919876543210", "+919876543210", t0());
        let loser = thread(&db, "9876543210", "+919876543210", t0() + Duration::hours(1));
        db.insert_message(&survivor.id, Some("m1"), Direction::Inbound, "a", t0()).unwrap();
        db.insert_message(&loser.id, Some("m2"), Direction::Inbound, "b", t0()).unwrap();
        let held = db.insert_message(&loser.id, Some("m3"), Direction::Inbound, "held", t0()).unwrap();
        db.conn()
            .execute_batch(
                "CREATE TEMP TRIGGER hold_message BEFORE UPDATE OF thread_id ON messages
                 WHEN OLD.body = 'held'
                 BEGIN SELECT RAISE(ABORT, 'held for review'); END;",
            )
            .unwrap();

        let out = db.merge_threads(&survivor.id, &[loser.id.clone()], t0()).unwrap();
        assert_eq!(out.messages_moved, 1);
        assert_eq!(out.messages_skipped, 1);
        assert_eq!(out.conflicts, 1);
        assert_eq!(out.threads_retained, 1);
        assert_eq!(out.threads_deleted, 0);

        let left: Vec<_> = db.list_messages(&loser.id).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(left, vec![held.id.clone()]);
        assert_eq!(db.message_count(&survivor.id).unwrap(), 2);
        assert_eq!(db.merge_conflict_count().unwrap(), 1);
        let (thread_id, message_id): (String, String) = db
            .conn()
            .query_row("SELECT thread_id, message_id FROM merge_conflicts", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!((thread_id, message_id), (loser.id.clone(), held.id));
    }

    #[test]
    fn test_merge_missing_survivor_is_conflict() {
        let db = temp_db();
        let loser = thread(&db, "9876543210", "+919876543210", t0());
        let err = db.merge_threads("gone", &[loser.id.clone()], t0()).unwrap_err();
        assert!(matches!(err, CrmError::Conflict(_)));
        assert!(db.get_thread(&loser.id).unwrap().is_some());
    }

    #[test]
    fn test_dedup_runs_newest_first() {
        let db = temp_db();
        let first = DedupSummary { threads_examined: 3, ..Default::default() };
        let second = DedupSummary { threads_examined: 5, duplicates_found: 1, ..Default::default() };
        db.record_dedup_run("operator", t0(), t0(), &first).unwrap();
        db.record_dedup_run("scheduled", t0(), t0(), &second).unwrap();

        let runs = db.recent_dedup_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].trigger, "scheduled");
        assert_eq!(runs[0].summary, second);
    }
}
