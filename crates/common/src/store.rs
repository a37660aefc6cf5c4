//! Shared KV store: the per-node VM catalog and the editor revision counters.
//!
//! Records serialize as JSON under `{ns}:vm:{id}`; the node's id set lives at
//! `{ns}:vms`; per-(container, path) revisions at `{ns}:fsrev:{cid}:{path}`.
//! The store is backed by SQLite in WAL mode behind a mutex. Catalog reads
//! reconcile liveness before returning: a record claiming `running` whose SSH
//! port does not accept a TCP connection within 1.5 s is flipped to `stopped`
//! and persisted, so the catalog self-heals after a crash.

use crate::types::{VmRecord, VmState};
use crate::{now_ts, Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SSH_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);
const RECONCILED_REASON: &str = "reconciled: ssh port not reachable";

#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Connection>,
    ns: String,
}

impl Store {
    /// Open or create the store at `path` under namespace `ns`.
    pub fn open(path: impl AsRef<Path>, ns: impl Into<String>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                ns: ns.into(),
            }),
        };
        store.init_schema()?;
        info!("Opened shared store at {:?}", path.as_ref());
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_memory(ns: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                ns: ns.into(),
            }),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.inner.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                k TEXT PRIMARY KEY,
                v TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS set_members (
                set_key TEXT NOT NULL,
                member TEXT NOT NULL,
                PRIMARY KEY (set_key, member)
            );
            CREATE TABLE IF NOT EXISTS counters (
                k TEXT PRIMARY KEY,
                v INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(())
    }

    fn vm_key(&self, vm_id: &str) -> String {
        format!("{}:vm:{}", self.inner.ns, vm_id)
    }

    fn ids_key(&self) -> String {
        format!("{}:vms", self.inner.ns)
    }

    fn rev_key(&self, cid: &str, path: &str) -> String {
        format!("{}:fsrev:{}:{}", self.inner.ns, cid, path)
    }

    // ------------------------------------------------------------------
    // Catalog (blocking core)
    // ------------------------------------------------------------------

    /// Upsert the record and add its id to the node's id set. The two writes
    /// go out in one transaction; atomicity is not strictly required since
    /// reconciliation self-heals, but it is free here.
    pub fn put_blocking(&self, vm: &mut VmRecord) -> Result<()> {
        vm.updated_at = now_ts();
        let json = serde_json::to_string(vm)?;
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO kv (k, v) VALUES (?1, ?2)
             ON CONFLICT(k) DO UPDATE SET v = excluded.v",
            params![self.vm_key(&vm.id), json],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO set_members (set_key, member) VALUES (?1, ?2)",
            params![self.ids_key(), vm.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Load one record, reconciling liveness before returning.
    pub fn get_blocking(&self, vm_id: &str) -> Result<VmRecord> {
        let json: Option<String> = {
            let conn = self.inner.conn.lock();
            conn.query_row(
                "SELECT v FROM kv WHERE k = ?1",
                params![self.vm_key(vm_id)],
                |row| row.get(0),
            )
            .optional()?
        };
        let json = json.ok_or_else(|| Error::not_found("vm", vm_id))?;
        let vm: VmRecord = serde_json::from_str(&json)?;
        self.reconcile(vm)
    }

    /// Load every record in the id set, each reconciled. Records whose JSON
    /// is missing or unparsable are skipped.
    pub fn all_blocking(&self) -> Result<Vec<VmRecord>> {
        let ids: Vec<String> = {
            let conn = self.inner.conn.lock();
            let mut stmt = conn
                .prepare("SELECT member FROM set_members WHERE set_key = ?1 ORDER BY member")?;
            let rows = stmt.query_map(params![self.ids_key()], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_blocking(&id) {
                Ok(vm) => out.push(vm),
                Err(Error::NotFound { .. }) => continue,
                Err(e) => {
                    warn!(vm_id = %id, error = %e, "Skipping unreadable catalog entry");
                    continue;
                }
            }
        }
        Ok(out)
    }

    /// Persist a state transition.
    pub fn set_status_blocking(
        &self,
        vm: &mut VmRecord,
        state: VmState,
        error_reason: Option<String>,
    ) -> Result<()> {
        vm.state = state;
        vm.error_reason = error_reason;
        self.put_blocking(vm)
    }

    /// Resync the whole catalog; invoked at agent startup to heal records
    /// left behind by a crash. Returns the number of records visited.
    pub fn reconcile_all_blocking(&self) -> Result<usize> {
        let mut count = 0;
        for vm in self.all_blocking()? {
            debug!(vm_id = %vm.id, state = %vm.state, "Reconciled catalog entry");
            count += 1;
        }
        Ok(count)
    }

    /// If the record claims running but nothing listens on its SSH port,
    /// flip it to stopped. No other automatic transitions.
    fn reconcile(&self, mut vm: VmRecord) -> Result<VmRecord> {
        if vm.state == VmState::Running && !ssh_alive(vm.ssh_port) {
            warn!(vm_id = %vm.id, port = ?vm.ssh_port, "Running VM unreachable; marking stopped");
            self.set_status_blocking(
                &mut vm,
                VmState::Stopped,
                Some(RECONCILED_REASON.to_string()),
            )?;
        }
        Ok(vm)
    }

    // ------------------------------------------------------------------
    // Revisions (blocking core)
    // ------------------------------------------------------------------

    /// Current revision for (container, path); 0 when never written.
    pub fn get_rev_blocking(&self, cid: &str, path: &str) -> Result<u64> {
        let conn = self.inner.conn.lock();
        let v: Option<i64> = conn
            .query_row(
                "SELECT v FROM counters WHERE k = ?1",
                params![self.rev_key(cid, path)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(v.unwrap_or(0) as u64)
    }

    /// Increment and return the new revision. Strictly monotonic per key.
    pub fn bump_rev_blocking(&self, cid: &str, path: &str) -> Result<u64> {
        let key = self.rev_key(cid, path);
        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO counters (k, v) VALUES (?1, 1)
             ON CONFLICT(k) DO UPDATE SET v = v + 1",
            params![key],
        )?;
        let v: i64 = tx.query_row("SELECT v FROM counters WHERE k = ?1", params![key], |row| {
            row.get(0)
        })?;
        tx.commit()?;
        Ok(v as u64)
    }

    // ------------------------------------------------------------------
    // Async boundary (blocking pool)
    // ------------------------------------------------------------------

    pub async fn put(&self, mut vm: VmRecord) -> Result<VmRecord> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            store.put_blocking(&mut vm)?;
            Ok(vm)
        })
        .await
        .map_err(|e| Error::Internal(format!("store task panicked: {e}")))?
    }

    pub async fn get(&self, vm_id: &str) -> Result<VmRecord> {
        let store = self.clone();
        let vm_id = vm_id.to_string();
        tokio::task::spawn_blocking(move || store.get_blocking(&vm_id))
            .await
            .map_err(|e| Error::Internal(format!("store task panicked: {e}")))?
    }

    pub async fn all(&self) -> Result<Vec<VmRecord>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.all_blocking())
            .await
            .map_err(|e| Error::Internal(format!("store task panicked: {e}")))?
    }

    pub async fn set_status(
        &self,
        mut vm: VmRecord,
        state: VmState,
        error_reason: Option<String>,
    ) -> Result<VmRecord> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            store.set_status_blocking(&mut vm, state, error_reason)?;
            Ok(vm)
        })
        .await
        .map_err(|e| Error::Internal(format!("store task panicked: {e}")))?
    }

    pub async fn reconcile_all(&self) -> Result<usize> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.reconcile_all_blocking())
            .await
            .map_err(|e| Error::Internal(format!("store task panicked: {e}")))?
    }

    pub async fn get_rev(&self, cid: &str, path: &str) -> Result<u64> {
        let store = self.clone();
        let (cid, path) = (cid.to_string(), path.to_string());
        tokio::task::spawn_blocking(move || store.get_rev_blocking(&cid, &path))
            .await
            .map_err(|e| Error::Internal(format!("store task panicked: {e}")))?
    }

    pub async fn bump_rev(&self, cid: &str, path: &str) -> Result<u64> {
        let store = self.clone();
        let (cid, path) = (cid.to_string(), path.to_string());
        tokio::task::spawn_blocking(move || store.bump_rev_blocking(&cid, &path))
            .await
            .map_err(|e| Error::Internal(format!("store task panicked: {e}")))?
    }
}

/// Quick TCP liveness probe against the VM's forwarded SSH port.
fn ssh_alive(port: Option<u16>) -> bool {
    let Some(port) = port else {
        return false;
    };
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    TcpStream::connect_timeout(&addr, SSH_PROBE_TIMEOUT).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn record(id: &str) -> VmRecord {
        VmRecord::new(id.to_string(), format!("/tmp/vms/{id}"), 2, 2048, 10)
    }

    #[test]
    fn put_get_round_trip() {
        let store = Store::open_memory("test").unwrap();
        let mut vm = record("vm-a");
        store.put_blocking(&mut vm).unwrap();

        let loaded = store.get_blocking("vm-a").unwrap();
        assert_eq!(loaded.id, "vm-a");
        assert_eq!(loaded.state, VmState::Provisioning);
        assert!(matches!(
            store.get_blocking("missing"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn all_returns_every_id_once() {
        let store = Store::open_memory("test").unwrap();
        for id in ["vm-a", "vm-b", "vm-c"] {
            store.put_blocking(&mut record(id)).unwrap();
        }
        // Re-put does not duplicate set membership.
        store.put_blocking(&mut record("vm-b")).unwrap();

        let all = store.all_blocking().unwrap();
        let ids: Vec<_> = all.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["vm-a", "vm-b", "vm-c"]);
    }

    #[test]
    fn running_vm_with_dead_port_is_reconciled_to_stopped() {
        let store = Store::open_memory("test").unwrap();

        // Find a port that is certainly closed: bind then drop.
        let dead_port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let mut vm = record("vm-dead");
        vm.state = VmState::Running;
        vm.ssh_port = Some(dead_port);
        vm.ssh_user = Some("root".to_string());
        store.put_blocking(&mut vm).unwrap();

        let loaded = store.get_blocking("vm-dead").unwrap();
        assert_eq!(loaded.state, VmState::Stopped);
        assert!(loaded.error_reason.unwrap().starts_with("reconciled:"));

        // The transition was persisted, not just returned.
        let again = store.get_blocking("vm-dead").unwrap();
        assert_eq!(again.state, VmState::Stopped);
    }

    #[test]
    fn running_vm_with_live_port_stays_running() {
        let store = Store::open_memory("test").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut vm = record("vm-live");
        vm.state = VmState::Running;
        vm.ssh_port = Some(port);
        store.put_blocking(&mut vm).unwrap();

        let loaded = store.get_blocking("vm-live").unwrap();
        assert_eq!(loaded.state, VmState::Running);
        assert_eq!(loaded.error_reason, None);
    }

    #[test]
    fn stopped_vm_is_left_alone() {
        let store = Store::open_memory("test").unwrap();
        let mut vm = record("vm-off");
        vm.state = VmState::Stopped;
        store.put_blocking(&mut vm).unwrap();

        let loaded = store.get_blocking("vm-off").unwrap();
        assert_eq!(loaded.state, VmState::Stopped);
        assert_eq!(loaded.error_reason, None);
    }

    #[test]
    fn revisions_are_strictly_monotonic() {
        let store = Store::open_memory("test").unwrap();
        assert_eq!(store.get_rev_blocking("c1", "/app/a.txt").unwrap(), 0);
        assert_eq!(store.bump_rev_blocking("c1", "/app/a.txt").unwrap(), 1);
        assert_eq!(store.bump_rev_blocking("c1", "/app/a.txt").unwrap(), 2);
        assert_eq!(store.get_rev_blocking("c1", "/app/a.txt").unwrap(), 2);

        // Independent per (container, path).
        assert_eq!(store.get_rev_blocking("c1", "/app/b.txt").unwrap(), 0);
        assert_eq!(store.bump_rev_blocking("c2", "/app/a.txt").unwrap(), 1);
    }

    #[test]
    fn store_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        {
            let store = Store::open(&path, "ns").unwrap();
            store.put_blocking(&mut record("vm-p")).unwrap();
            store.bump_rev_blocking("c1", "/app/x").unwrap();
        }
        let store = Store::open(&path, "ns").unwrap();
        assert_eq!(store.get_blocking("vm-p").unwrap().id, "vm-p");
        assert_eq!(store.get_rev_blocking("c1", "/app/x").unwrap(), 1);
    }
}
