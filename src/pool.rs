//! Finite resource pools: IPv4 addresses, IPv6 addresses, numeric VM ids.
//!
//! Allocation state lives in the same SQLite database as the VM records
//! (`pool_alloc` table), so an allocate runs in the same locking domain as
//! record inserts: an IMMEDIATE transaction takes the write lock, reads the
//! allocated set, picks the lowest free value in the configured range, and
//! inserts it. Two concurrent `create` calls therefore can never receive the
//! same value.
//!
//! Release deletes the row; releasing something that was never allocated is
//! deliberately a no-op so that `destroy` stays idempotent.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use rusqlite::{TransactionBehavior, params};

use crate::config::{Ipv4Pool, Ipv6Pool, VmidPool};
use crate::db::VmDatabase;
use crate::error::{LeaseError, Result};

const KIND_IPV4: &str = "ipv4";
const KIND_IPV6: &str = "ipv6";
const KIND_VMID: &str = "vmid";

#[derive(Debug, Clone)]
pub struct PoolAllocator {
    db: VmDatabase,
    ipv4: Ipv4Pool,
    ipv6: Option<Ipv6Pool>,
    vmid: Option<VmidPool>,
}

impl PoolAllocator {
    pub fn new(
        db: VmDatabase,
        ipv4: Ipv4Pool,
        ipv6: Option<Ipv6Pool>,
        vmid: Option<VmidPool>,
    ) -> Self {
        Self {
            db,
            ipv4,
            ipv6,
            vmid,
        }
    }

    pub fn ipv6_configured(&self) -> bool {
        self.ipv6.is_some()
    }

    pub fn vmid_configured(&self) -> bool {
        self.vmid.is_some()
    }

    /// Lowest free IPv4 address in the configured range.
    pub fn allocate_ipv4(&self) -> Result<Ipv4Addr> {
        let start = u32::from(self.ipv4.start);
        let end = u32::from(self.ipv4.end);
        let value = self.allocate_scan(KIND_IPV4, "IPv4", start as u128, end as u128, |v| {
            Ipv4Addr::from(v as u32).to_string()
        })?;
        Ok(Ipv4Addr::from(value as u32))
    }

    /// Lowest free IPv6 address, or `PoolNotConfigured` when no block has
    /// been delegated to this host.
    pub fn allocate_ipv6(&self) -> Result<Ipv6Addr> {
        let pool = self
            .ipv6
            .as_ref()
            .ok_or(LeaseError::PoolNotConfigured { pool: "IPv6" })?;
        let start = u128::from(pool.start);
        let end = u128::from(pool.end);
        let value = self.allocate_scan(KIND_IPV6, "IPv6", start, end, |v| {
            Ipv6Addr::from(v).to_string()
        })?;
        Ok(Ipv6Addr::from(value))
    }

    /// Lowest free numeric VM id, or `PoolNotConfigured` when the operator
    /// configured no range (allocation disabled, no implicit default).
    pub fn allocate_vmid(&self) -> Result<i64> {
        let pool = self
            .vmid
            .as_ref()
            .ok_or(LeaseError::PoolNotConfigured { pool: "vmid" })?;
        let value = self.allocate_scan(
            KIND_VMID,
            "vmid",
            pool.start as u128,
            pool.end as u128,
            |v| (v as i64).to_string(),
        )?;
        Ok(value as i64)
    }

    pub fn release_ipv4(&self, addr: Ipv4Addr) -> Result<()> {
        self.release(KIND_IPV4, &addr.to_string())
    }

    pub fn release_ipv6(&self, addr: Ipv6Addr) -> Result<()> {
        self.release(KIND_IPV6, &addr.to_string())
    }

    pub fn release_vmid(&self, vmid: i64) -> Result<()> {
        self.release(KIND_VMID, &vmid.to_string())
    }

    /// Scan `start..=end` for the lowest value not currently allocated, mark
    /// its rendered form, and return it. The scan inspects at most
    /// `allocated + 1` candidates: if the first `n + 1` values of the range
    /// are all taken by an `n`-entry allocated set, the set would have to be
    /// larger than it is.
    fn allocate_scan<F>(
        &self,
        kind: &'static str,
        pool_name: &'static str,
        start: u128,
        end: u128,
        render: F,
    ) -> Result<u128>
    where
        F: Fn(u128) -> String,
    {
        if end < start {
            return Err(LeaseError::Validation {
                what: "pool range",
                value: format!("{pool_name} range end precedes start"),
            });
        }
        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let allocated: HashSet<String> = {
            let mut stmt = tx.prepare("SELECT value FROM pool_alloc WHERE kind = ?1")?;
            let rows = stmt.query_map(params![kind], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut candidate = start;
        loop {
            if candidate > end {
                return Err(LeaseError::PoolExhausted { pool: pool_name });
            }
            let value = render(candidate);
            if !allocated.contains(&value) {
                tx.execute(
                    "INSERT INTO pool_alloc (kind, value) VALUES (?1, ?2)",
                    params![kind, value],
                )?;
                tx.commit()?;
                return Ok(candidate);
            }
            candidate += 1;
        }
    }

    fn release(&self, kind: &'static str, value: &str) -> Result<()> {
        let conn = self.db.conn()?;
        // Zero rows affected is fine: release of a never-allocated value is
        // a no-op by contract.
        conn.execute(
            "DELETE FROM pool_alloc WHERE kind = ?1 AND value = ?2",
            params![kind, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn pool_at(path: &Path) -> PoolAllocator {
        let db = VmDatabase::open(path).expect("open db");
        PoolAllocator::new(
            db,
            Ipv4Pool {
                network: "203.0.113.0/24".into(),
                start: "203.0.113.10".parse().unwrap(),
                end: "203.0.113.12".parse().unwrap(),
                gateway: "203.0.113.1".parse().unwrap(),
            },
            Some(Ipv6Pool {
                start: "2001:db8::10".parse().unwrap(),
                end: "2001:db8::12".parse().unwrap(),
                gateway: "2001:db8::1".parse().unwrap(),
            }),
            Some(VmidPool { start: 100, end: 102 }),
        )
    }

    fn test_pool() -> (tempfile::TempDir, PoolAllocator) {
        let dir = tempfile::tempdir().expect("tempdir");
        let pools = pool_at(&dir.path().join("vms.db"));
        (dir, pools)
    }

    #[test]
    fn ipv4_allocates_lowest_free_in_order() {
        let (_dir, pools) = test_pool();
        assert_eq!(pools.allocate_ipv4().unwrap().to_string(), "203.0.113.10");
        assert_eq!(pools.allocate_ipv4().unwrap().to_string(), "203.0.113.11");
        assert_eq!(pools.allocate_ipv4().unwrap().to_string(), "203.0.113.12");
    }

    #[test]
    fn ipv4_exhaustion_is_an_error() {
        let (_dir, pools) = test_pool();
        for _ in 0..3 {
            pools.allocate_ipv4().unwrap();
        }
        assert!(matches!(
            pools.allocate_ipv4(),
            Err(LeaseError::PoolExhausted { pool: "IPv4" })
        ));
    }

    #[test]
    fn release_then_allocate_returns_same_address() {
        let (_dir, pools) = test_pool();
        let first = pools.allocate_ipv4().unwrap();
        pools.release_ipv4(first).unwrap();
        let again = pools.allocate_ipv4().unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn release_of_unallocated_address_is_a_noop() {
        let (_dir, pools) = test_pool();
        pools.release_ipv4("203.0.113.99".parse().unwrap()).unwrap();
        // Pool unaffected: next allocation is still the range start.
        assert_eq!(pools.allocate_ipv4().unwrap().to_string(), "203.0.113.10");
    }

    #[test]
    fn ipv6_without_delegated_block_fails_distinctly() {
        let dir = tempfile::tempdir().unwrap();
        let db = VmDatabase::open(&dir.path().join("vms.db")).unwrap();
        let pools = PoolAllocator::new(
            db,
            Ipv4Pool {
                network: "203.0.113.0/24".into(),
                start: "203.0.113.10".parse().unwrap(),
                end: "203.0.113.12".parse().unwrap(),
                gateway: "203.0.113.1".parse().unwrap(),
            },
            None,
            None,
        );
        assert!(matches!(
            pools.allocate_ipv6(),
            Err(LeaseError::PoolNotConfigured { pool: "IPv6" })
        ));
        assert!(matches!(
            pools.allocate_vmid(),
            Err(LeaseError::PoolNotConfigured { pool: "vmid" })
        ));
    }

    #[test]
    fn vmid_allocation_counts_up_from_start() {
        let (_dir, pools) = test_pool();
        assert_eq!(pools.allocate_vmid().unwrap(), 100);
        assert_eq!(pools.allocate_vmid().unwrap(), 101);
        pools.release_vmid(100).unwrap();
        assert_eq!(pools.allocate_vmid().unwrap(), 100);
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vms.db");
        // Widen the range so every thread can succeed.
        let db = VmDatabase::open(&path).unwrap();
        let pools = PoolAllocator::new(
            db,
            Ipv4Pool {
                network: "203.0.113.0/24".into(),
                start: "203.0.113.10".parse().unwrap(),
                end: "203.0.113.200".parse().unwrap(),
                gateway: "203.0.113.1".parse().unwrap(),
            },
            None,
            None,
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pools = pools.clone();
            handles.push(std::thread::spawn(move || {
                (0..4)
                    .map(|_| pools.allocate_ipv4().unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for addr in handle.join().expect("thread panicked") {
                assert!(seen.insert(addr), "address {addr} allocated twice");
            }
        }
        assert_eq!(seen.len(), 32);
    }
}
