//! Tenant projection used by the trial checker and the normalizer's
//! per-tenant country hint.

use bharat_core::error::{CrmError, Result};
use bharat_core::types::Tenant;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use crate::{CrmDb, get_opt_ts, get_ts, new_id, ts};

const TENANT_SELECT: &str =
    "SELECT id, name, plan, status, subscription_end, default_country, created_at FROM tenants";

fn row_to_tenant(row: &rusqlite::Row) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        plan: row.get(2)?,
        status: row.get(3)?,
        subscription_end: get_opt_ts(row, 4)?,
        default_country: row.get(5)?,
        created_at: get_ts(row, 6)?,
    })
}

impl CrmDb {
    // ── Tenant CRUD ────────────────────────────────────

    /// Create a tenant.
    pub fn create_tenant(
        &self,
        name: &str,
        plan: &str,
        subscription_end: Option<DateTime<Utc>>,
        default_country: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Tenant> {
        let id = new_id();
        self.conn()
            .execute(
                "INSERT INTO tenants (id, name, plan, status, subscription_end, default_country, created_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6)",
                params![id, name, plan, subscription_end.as_ref().map(ts), default_country, ts(&now)],
            )
            .map_err(|e| CrmError::store(format!("Insert tenant: {e}")))?;
        self.get_tenant(&id)
    }

    /// Get a tenant by ID.
    pub fn get_tenant(&self, id: &str) -> Result<Tenant> {
        self.conn()
            .query_row(&format!("{TENANT_SELECT} WHERE id = ?1"), params![id], row_to_tenant)
            .optional()
            .map_err(|e| CrmError::store(format!("Get tenant: {e}")))?
            .ok_or_else(|| CrmError::NotFound(format!("tenant {id}")))
    }

    /// List all tenants.
    pub fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("{TENANT_SELECT} ORDER BY created_at, id"))
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let tenants = stmt
            .query_map([], row_to_tenant)
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read tenant: {e}")))?;
        Ok(tenants)
    }

    /// Trial tenants whose subscription has ended and that are not yet
    /// suspended.
    pub fn expired_trials(&self, now: DateTime<Utc>) -> Result<Vec<Tenant>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{TENANT_SELECT} WHERE plan = 'trial' AND status != 'suspended'
                 AND subscription_end IS NOT NULL AND subscription_end <= ?1
                 ORDER BY subscription_end, id"
            ))
            .map_err(|e| CrmError::store(format!("Prepare: {e}")))?;
        let tenants = stmt
            .query_map(params![ts(&now)], row_to_tenant)
            .map_err(|e| CrmError::store(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CrmError::store(format!("Read tenant: {e}")))?;
        Ok(tenants)
    }

    /// Suspend an expired trial. Conditional on the same predicate the
    /// selection used, so concurrent edits (an upgrade, a manual suspend)
    /// win. Returns whether this call changed the row.
    pub fn suspend_expired_trial(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tenants SET status = 'suspended', suspended_at = ?1
                 WHERE id = ?2 AND plan = 'trial' AND status != 'suspended'
                 AND subscription_end IS NOT NULL AND subscription_end <= ?1",
                params![ts(&now), id],
            )
            .map_err(|e| CrmError::store(format!("Suspend tenant: {e}")))?;
        Ok(changed == 1)
    }

    /// Set a tenant's plan (upgrade/downgrade by the billing side).
    pub fn update_tenant_plan(&self, id: &str, plan: &str, subscription_end: Option<DateTime<Utc>>) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE tenants SET plan = ?1, subscription_end = ?2 WHERE id = ?3",
                params![plan, subscription_end.as_ref().map(ts), id],
            )
            .map_err(|e| CrmError::store(format!("Update plan: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use chrono::Duration;

    #[test]
    fn test_create_and_get_tenant() {
        let db = temp_db();
        let t = db.create_tenant("Acme", "trial", Some(t0()), Some("+91"), t0()).unwrap();
        assert_eq!(t.status, "active");
        assert_eq!(t.default_country.as_deref(), Some("+91"));
        assert_eq!(db.get_tenant(&t.id).unwrap().subscription_end, Some(t0()));
        assert!(db.get_tenant("missing").is_err());
    }

    #[test]
    fn test_expired_trials_and_suspend() {
        let db = temp_db();
        let expired = db.create_tenant("Old", "trial", Some(t0() - Duration::days(1)), None, t0()).unwrap();
        db.create_tenant("Fresh", "trial", Some(t0() + Duration::days(3)), None, t0()).unwrap();
        db.create_tenant("Paid", "pro", Some(t0() - Duration::days(1)), None, t0()).unwrap();

        let due = db.expired_trials(t0()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, expired.id);

        assert!(db.suspend_expired_trial(&expired.id, t0()).unwrap());
        assert!(!db.suspend_expired_trial(&expired.id, t0()).unwrap());
        assert!(db.expired_trials(t0()).unwrap().is_empty());
    }

    #[test]
    fn test_upgrade_wins_over_suspend() {
        let db = temp_db();
        let t = db.create_tenant("Upgrader", "trial", Some(t0() - Duration::hours(1)), None, t0()).unwrap();
        db.update_tenant_plan(&t.id, "pro", Some(t0() + Duration::days(30))).unwrap();
        assert!(!db.suspend_expired_trial(&t.id, t0()).unwrap());
        assert_eq!(db.get_tenant(&t.id).unwrap().status, "active");
    }
}
