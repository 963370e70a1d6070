//! Durable VM record store over SQLite.
//!
//! One row per provisioned VM, keyed by name. The store is the concurrency
//! authority for lifecycle operations: `update_with` runs its read-modify-
//! write inside an IMMEDIATE transaction, so two processes racing on the
//! same name serialize at the database layer rather than through in-memory
//! locks. WAL mode keeps concurrent readers cheap.
//!
//! Destroyed records are retained for audit and are immutable — `update_with`
//! refuses to touch them, and callers that need destroy idempotency check the
//! status first and treat "already destroyed" as success.
//!
//! The same database also holds the resource pool allocation tables used by
//! [`crate::pool::PoolAllocator`], so address allocation shares the same
//! locking domain as record updates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use crate::error::{LeaseError, Result};

/// Recorded lifecycle state. Three values only — the live hypervisor state
/// maps onto these (plus `unknown`) for display, but the record is
/// authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Active,
    Suspended,
    Destroyed,
}

impl VmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::Active => "active",
            VmStatus::Suspended => "suspended",
            VmStatus::Destroyed => "destroyed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(VmStatus::Active),
            "suspended" => Ok(VmStatus::Suspended),
            "destroyed" => Ok(VmStatus::Destroyed),
            other => Err(LeaseError::Other(anyhow::anyhow!(
                "corrupt status value in database: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provisioned VM. Identity fields (`name`, `vmid`, `ipv4`, `ipv6`,
/// `created_at`) never change after insert; the pool entries behind the
/// addresses are released on destroy but the values stay on the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub vmid: Option<i64>,
    pub ipv4: std::net::Ipv4Addr,
    pub ipv6: Option<std::net::Ipv6Addr>,
    pub owner: String,
    pub wallet_address: Option<String>,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub destroyed_at: Option<DateTime<Utc>>,
    pub status: VmStatus,
}

impl VmRecord {
    fn check_invariants(&self) -> Result<()> {
        if self.expires_at < self.created_at {
            return Err(LeaseError::Validation {
                what: "expires_at",
                value: format!("{} precedes created_at", self.expires_at),
            });
        }
        if let Some(s) = self.suspended_at {
            if s < self.created_at {
                return Err(LeaseError::Validation {
                    what: "suspended_at",
                    value: format!("{s} precedes created_at"),
                });
            }
        }
        if self.status == VmStatus::Destroyed && self.destroyed_at.is_none() {
            return Err(LeaseError::Validation {
                what: "destroyed_at",
                value: "must be set when status is destroyed".into(),
            });
        }
        Ok(())
    }
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS vms (
    name          TEXT PRIMARY KEY,
    vmid          INTEGER,
    ipv4          TEXT NOT NULL,
    ipv6          TEXT,
    owner         TEXT NOT NULL,
    wallet_address TEXT,
    purpose       TEXT NOT NULL DEFAULT '',
    created_at    TEXT NOT NULL,
    expires_at    TEXT NOT NULL,
    suspended_at  TEXT,
    destroyed_at  TEXT,
    status        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pool_alloc (
    kind  TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (kind, value)
);
";

/// Handle to the on-disk database. Cheap to clone; every operation opens its
/// own connection, so the handle is freely shared across threads and
/// processes.
#[derive(Debug, Clone)]
pub struct VmDatabase {
    path: PathBuf,
}

impl VmDatabase {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("creating {}: {e}", parent.display()))?;
        }
        let db = Self {
            path: path.to_path_buf(),
        };
        let conn = db.conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(conn)
    }

    /// Insert a fresh record. Fails if a record with the same name already
    /// exists in any state — names are never reused, destroyed records
    /// included.
    pub fn insert(&self, record: &VmRecord) -> Result<()> {
        record.check_invariants()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists: Option<String> = tx
            .query_row(
                "SELECT name FROM vms WHERE name = ?1",
                params![record.name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(LeaseError::Validation {
                what: "name",
                value: format!("'{}' already exists", record.name),
            });
        }
        tx.execute(
            "INSERT INTO vms (name, vmid, ipv4, ipv6, owner, wallet_address, purpose,
                              created_at, expires_at, suspended_at, destroyed_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.name,
                record.vmid,
                record.ipv4.to_string(),
                record.ipv6.map(|a| a.to_string()),
                record.owner,
                record.wallet_address,
                record.purpose,
                record.created_at.to_rfc3339(),
                record.expires_at.to_rfc3339(),
                record.suspended_at.map(|t| t.to_rfc3339()),
                record.destroyed_at.map(|t| t.to_rfc3339()),
                record.status.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<VmRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT name, vmid, ipv4, ipv6, owner, wallet_address, purpose,
                        created_at, expires_at, suspended_at, destroyed_at, status
                 FROM vms WHERE name = ?1",
                params![name],
                row_to_record,
            )
            .optional()?;
        row.map(finish_record).transpose()
    }

    /// All records, destroyed included, ordered by name.
    pub fn list(&self) -> Result<Vec<VmRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, vmid, ipv4, ipv6, owner, wallet_address, purpose,
                    created_at, expires_at, suspended_at, destroyed_at, status
             FROM vms ORDER BY name",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_record(row?)?);
        }
        Ok(out)
    }

    /// Atomic read-modify-write on one record. The closure runs inside an
    /// IMMEDIATE transaction — this is the per-name critical section that
    /// keeps concurrent `destroy`/`resume` calls from racing. Returns the
    /// updated record.
    ///
    /// Rejected outright when the record is destroyed (terminal state) or
    /// when the closure mutates an identity field or violates a timestamp
    /// invariant; in either case the transaction rolls back.
    pub fn update_with<F>(&self, name: &str, f: F) -> Result<VmRecord>
    where
        F: FnOnce(&mut VmRecord) -> Result<()>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw = tx
            .query_row(
                "SELECT name, vmid, ipv4, ipv6, owner, wallet_address, purpose,
                        created_at, expires_at, suspended_at, destroyed_at, status
                 FROM vms WHERE name = ?1",
                params![name],
                row_to_record,
            )
            .optional()?
            .ok_or_else(|| LeaseError::NotFound(name.to_string()))?;
        let before = finish_record(raw)?;
        if before.status == VmStatus::Destroyed {
            return Err(LeaseError::WrongState {
                name: name.to_string(),
                expected: "active or suspended",
                actual: "destroyed".into(),
            });
        }

        let mut record = before.clone();
        f(&mut record)?;

        // Identity fields are immutable once set.
        if record.name != before.name
            || record.vmid != before.vmid
            || record.ipv4 != before.ipv4
            || record.ipv6 != before.ipv6
            || record.created_at != before.created_at
        {
            return Err(LeaseError::Validation {
                what: "record",
                value: "identity fields are immutable".into(),
            });
        }
        record.check_invariants()?;

        tx.execute(
            "UPDATE vms SET owner = ?2, wallet_address = ?3, purpose = ?4,
                            expires_at = ?5, suspended_at = ?6, destroyed_at = ?7,
                            status = ?8
             WHERE name = ?1",
            params![
                record.name,
                record.owner,
                record.wallet_address,
                record.purpose,
                record.expires_at.to_rfc3339(),
                record.suspended_at.map(|t| t.to_rfc3339()),
                record.destroyed_at.map(|t| t.to_rfc3339()),
                record.status.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(record)
    }
}

/// Intermediate row form: timestamps and addresses still strings. rusqlite's
/// row closure can only fail with its own error type, so parsing finishes in
/// [`finish_record`].
struct RawRecord {
    name: String,
    vmid: Option<i64>,
    ipv4: String,
    ipv6: Option<String>,
    owner: String,
    wallet_address: Option<String>,
    purpose: String,
    created_at: String,
    expires_at: String,
    suspended_at: Option<String>,
    destroyed_at: Option<String>,
    status: String,
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        name: row.get(0)?,
        vmid: row.get(1)?,
        ipv4: row.get(2)?,
        ipv6: row.get(3)?,
        owner: row.get(4)?,
        wallet_address: row.get(5)?,
        purpose: row.get(6)?,
        created_at: row.get(7)?,
        expires_at: row.get(8)?,
        suspended_at: row.get(9)?,
        destroyed_at: row.get(10)?,
        status: row.get(11)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LeaseError::Other(anyhow::anyhow!("corrupt timestamp '{s}': {e}")))
}

fn finish_record(raw: RawRecord) -> Result<VmRecord> {
    Ok(VmRecord {
        ipv4: raw
            .ipv4
            .parse()
            .map_err(|e| anyhow::anyhow!("corrupt ipv4 '{}': {e}", raw.ipv4))?,
        ipv6: raw
            .ipv6
            .as_deref()
            .map(|s| {
                s.parse()
                    .map_err(|e| anyhow::anyhow!("corrupt ipv6 '{s}': {e}"))
            })
            .transpose()?,
        created_at: parse_ts(&raw.created_at)?,
        expires_at: parse_ts(&raw.expires_at)?,
        suspended_at: raw.suspended_at.as_deref().map(parse_ts).transpose()?,
        destroyed_at: raw.destroyed_at.as_deref().map(parse_ts).transpose()?,
        status: VmStatus::parse(&raw.status)?,
        name: raw.name,
        vmid: raw.vmid,
        owner: raw.owner,
        wallet_address: raw.wallet_address,
        purpose: raw.purpose,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn test_db() -> (tempfile::TempDir, VmDatabase) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = VmDatabase::open(&dir.path().join("vms.db")).expect("open db");
        (dir, db)
    }

    fn record(name: &str) -> VmRecord {
        let now = Utc::now();
        VmRecord {
            name: name.to_string(),
            vmid: Some(101),
            ipv4: "203.0.113.10".parse().unwrap(),
            ipv6: None,
            owner: "alice".into(),
            wallet_address: Some("0xabc".into()),
            purpose: "ci runner".into(),
            created_at: now,
            expires_at: now + ChronoDuration::days(30),
            suspended_at: None,
            destroyed_at: None,
            status: VmStatus::Active,
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let (_dir, db) = test_db();
        db.insert(&record("alice-1")).unwrap();
        let got = db.get("alice-1").unwrap().expect("record present");
        assert_eq!(got.owner, "alice");
        assert_eq!(got.status, VmStatus::Active);
        assert_eq!(got.ipv4.to_string(), "203.0.113.10");
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let (_dir, db) = test_db();
        db.insert(&record("alice-1")).unwrap();
        let err = db.insert(&record("alice-1")).unwrap_err();
        assert!(matches!(err, LeaseError::Validation { .. }));
    }

    #[test]
    fn expires_before_created_is_rejected() {
        let (_dir, db) = test_db();
        let mut r = record("bad-times");
        r.expires_at = r.created_at - ChronoDuration::hours(1);
        assert!(matches!(
            db.insert(&r),
            Err(LeaseError::Validation { what: "expires_at", .. })
        ));
    }

    #[test]
    fn update_with_mutates_atomically() {
        let (_dir, db) = test_db();
        db.insert(&record("alice-1")).unwrap();
        let updated = db
            .update_with("alice-1", |r| {
                r.status = VmStatus::Suspended;
                r.suspended_at = Some(Utc::now());
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.status, VmStatus::Suspended);
        assert!(updated.suspended_at.is_some());
        let reread = db.get("alice-1").unwrap().unwrap();
        assert_eq!(reread.status, VmStatus::Suspended);
    }

    #[test]
    fn destroyed_records_are_immutable() {
        let (_dir, db) = test_db();
        db.insert(&record("alice-1")).unwrap();
        db.update_with("alice-1", |r| {
            r.status = VmStatus::Destroyed;
            r.destroyed_at = Some(Utc::now());
            Ok(())
        })
        .unwrap();

        let err = db
            .update_with("alice-1", |r| {
                r.owner = "mallory".into();
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, LeaseError::WrongState { .. }));

        let reread = db.get("alice-1").unwrap().unwrap();
        assert_eq!(reread.owner, "alice");
        assert!(reread.destroyed_at.is_some());
    }

    #[test]
    fn identity_fields_cannot_change() {
        let (_dir, db) = test_db();
        db.insert(&record("alice-1")).unwrap();
        let err = db
            .update_with("alice-1", |r| {
                r.ipv4 = "203.0.113.99".parse().unwrap();
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, LeaseError::Validation { .. }));
    }

    #[test]
    fn destroyed_without_timestamp_is_rejected() {
        let (_dir, db) = test_db();
        db.insert(&record("alice-1")).unwrap();
        let err = db
            .update_with("alice-1", |r| {
                r.status = VmStatus::Destroyed;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, LeaseError::Validation { .. }));
    }

    #[test]
    fn update_missing_record_is_not_found() {
        let (_dir, db) = test_db();
        let err = db.update_with("ghost", |_| Ok(())).unwrap_err();
        assert!(matches!(err, LeaseError::NotFound(_)));
    }

    #[test]
    fn list_returns_all_records_sorted() {
        let (_dir, db) = test_db();
        let mut b = record("bob-1");
        b.ipv4 = "203.0.113.11".parse().unwrap();
        db.insert(&b).unwrap();
        db.insert(&record("alice-1")).unwrap();
        let all = db.list().unwrap();
        let names: Vec<_> = all.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alice-1", "bob-1"]);
    }
}
