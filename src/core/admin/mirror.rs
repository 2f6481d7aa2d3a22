// src/core/admin/mirror.rs

//! The local durable mirror store: a SQLite table set written best-effort in
//! lockstep with FSM applies. The FSM is authoritative; a mirror failure is
//! logged and counted, never fatal.

use crate::config::MirrorTarget;
use crate::core::admin::state::{LauncherInfo, NamespaceInfo, PatternAssignment, ProxyInfo};
use crate::core::errors::CitrineError;
use crate::core::metrics;
use rusqlite::{Connection, params};
use std::sync::mpsc::{SyncSender, TrySendError, sync_channel};
use std::time::Duration;
use tracing::{info, warn};

/// The capacity of the channel feeding the writer thread. Large enough that
/// slow disk I/O does not stall applies; overflow drops the write.
const MIRROR_CHANNEL_CAPACITY: usize = 65536;

/// Per-statement budget on the writer side.
const MIRROR_WRITE_BUDGET: Duration = Duration::from_secs(5);

const SCHEMA_VERSION: i64 = 1;

/// One unit of mirror work, produced by the FSM after a successful apply.
#[derive(Debug, Clone)]
pub enum MirrorOp {
    UpsertProxy(ProxyInfo),
    UpsertLauncher(LauncherInfo),
    UpsertNamespace(NamespaceInfo),
    UpsertPattern(PatternAssignment),
    Audit {
        command: String,
        issuer: String,
        timestamp: u64,
        detail: String,
    },
}

/// A cloneable, non-blocking handle to the mirror writer thread.
#[derive(Debug, Clone)]
pub struct MirrorHandle {
    tx: SyncSender<MirrorOp>,
}

impl MirrorHandle {
    /// Enqueues one mirror write. Best-effort: a full or closed channel is
    /// logged and the write dropped.
    pub fn write(&self, op: MirrorOp) {
        match self.tx.try_send(op) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::MIRROR_WRITE_FAILURES_TOTAL.inc();
                warn!("Mirror store channel is full; dropping write. The mirror is lagging behind applies.");
            }
            Err(TrySendError::Disconnected(_)) => {
                metrics::MIRROR_WRITE_FAILURES_TOTAL.inc();
                warn!("Mirror store writer has stopped; dropping write.");
            }
        }
    }
}

/// Opens the mirror store and spawns the dedicated writer thread. The thread
/// owns the SQLite connection and drains the channel until every handle is
/// dropped.
pub fn spawn_writer(target: &MirrorTarget) -> Result<MirrorHandle, CitrineError> {
    let conn = open_connection(target)?;
    let (tx, rx) = sync_channel::<MirrorOp>(MIRROR_CHANNEL_CAPACITY);

    std::thread::Builder::new()
        .name("citrine-mirror".to_string())
        .spawn(move || {
            while let Ok(op) = rx.recv() {
                if let Err(e) = apply_op(&conn, &op) {
                    metrics::MIRROR_WRITE_FAILURES_TOTAL.inc();
                    warn!("Mirror store write failed: {}", e);
                }
            }
            info!("Mirror store writer stopped.");
        })
        .map_err(|e| CitrineError::MirrorWrite(format!("failed to spawn writer thread: {e}")))?;

    Ok(MirrorHandle { tx })
}

fn open_connection(target: &MirrorTarget) -> Result<Connection, CitrineError> {
    let conn = match target {
        MirrorTarget::File(path) => {
            if let Some(parent) = std::path::Path::new(path).parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(path)?
        }
        MirrorTarget::Memory => Connection::open_in_memory()?,
    };
    conn.busy_timeout(MIRROR_WRITE_BUDGET)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Idempotent DDL for the full mirror table set.
fn run_migrations(conn: &Connection) -> Result<(), CitrineError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS proxies (
            proxy_id TEXT PRIMARY KEY,
            address TEXT NOT NULL,
            region TEXT NOT NULL,
            version TEXT NOT NULL,
            capabilities TEXT NOT NULL,
            status TEXT NOT NULL,
            last_seen INTEGER NOT NULL,
            registered_at INTEGER NOT NULL,
            resources TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS launchers (
            launcher_id TEXT PRIMARY KEY,
            address TEXT NOT NULL,
            region TEXT NOT NULL,
            version TEXT NOT NULL,
            process_types TEXT NOT NULL,
            status TEXT NOT NULL,
            last_seen INTEGER NOT NULL,
            registered_at INTEGER NOT NULL,
            max_processes INTEGER NOT NULL,
            available_slots INTEGER NOT NULL,
            resources TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS namespaces (
            name TEXT PRIMARY KEY,
            partition_id INTEGER NOT NULL,
            assigned_proxy TEXT NOT NULL,
            config TEXT NOT NULL,
            created_by TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS patterns (
            pattern_id TEXT PRIMARY KEY,
            pattern_type TEXT NOT NULL,
            launcher_id TEXT NOT NULL,
            namespace TEXT NOT NULL,
            config TEXT NOT NULL,
            status TEXT NOT NULL,
            assigned_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS audit_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            command TEXT NOT NULL,
            issuer TEXT NOT NULL,
            ts INTEGER NOT NULL,
            recorded_at TEXT NOT NULL,
            detail TEXT NOT NULL
        );",
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;
    Ok(())
}

fn apply_op(conn: &Connection, op: &MirrorOp) -> Result<(), CitrineError> {
    match op {
        MirrorOp::UpsertProxy(p) => {
            conn.execute(
                "INSERT INTO proxies (proxy_id, address, region, version, capabilities, status, last_seen, registered_at, resources)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(proxy_id) DO UPDATE SET
                   address = excluded.address, region = excluded.region,
                   version = excluded.version, capabilities = excluded.capabilities,
                   status = excluded.status, last_seen = excluded.last_seen,
                   resources = excluded.resources",
                params![
                    p.proxy_id,
                    p.address,
                    p.region,
                    p.version,
                    serde_json::to_string(&p.capabilities)?,
                    p.status.to_string(),
                    p.last_seen as i64,
                    p.registered_at as i64,
                    serde_json::to_string(&p.resources)?,
                ],
            )?;
        }
        MirrorOp::UpsertLauncher(l) => {
            conn.execute(
                "INSERT INTO launchers (launcher_id, address, region, version, process_types, status, last_seen, registered_at, max_processes, available_slots, resources)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(launcher_id) DO UPDATE SET
                   address = excluded.address, region = excluded.region,
                   version = excluded.version, process_types = excluded.process_types,
                   status = excluded.status, last_seen = excluded.last_seen,
                   max_processes = excluded.max_processes,
                   available_slots = excluded.available_slots,
                   resources = excluded.resources",
                params![
                    l.launcher_id,
                    l.address,
                    l.region,
                    l.version,
                    serde_json::to_string(&l.process_types)?,
                    l.status.to_string(),
                    l.last_seen as i64,
                    l.registered_at as i64,
                    l.max_processes,
                    l.available_slots,
                    serde_json::to_string(&l.resources)?,
                ],
            )?;
        }
        MirrorOp::UpsertNamespace(n) => {
            conn.execute(
                "INSERT INTO namespaces (name, partition_id, assigned_proxy, config, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(name) DO UPDATE SET
                   partition_id = excluded.partition_id,
                   assigned_proxy = excluded.assigned_proxy,
                   config = excluded.config, updated_at = excluded.updated_at",
                params![
                    n.name,
                    n.partition_id,
                    n.assigned_proxy,
                    serde_json::to_string(&n.config)?,
                    n.created_by,
                    n.created_at as i64,
                    n.updated_at as i64,
                ],
            )?;
        }
        MirrorOp::UpsertPattern(p) => {
            conn.execute(
                "INSERT INTO patterns (pattern_id, pattern_type, launcher_id, namespace, config, status, assigned_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(pattern_id) DO UPDATE SET
                   pattern_type = excluded.pattern_type,
                   launcher_id = excluded.launcher_id,
                   namespace = excluded.namespace,
                   config = excluded.config, status = excluded.status,
                   updated_at = excluded.updated_at",
                params![
                    p.pattern_id,
                    p.pattern_type,
                    p.launcher_id,
                    p.namespace,
                    serde_json::to_string(&p.config)?,
                    p.status.to_string(),
                    p.assigned_at as i64,
                    p.updated_at as i64,
                ],
            )?;
        }
        MirrorOp::Audit {
            command,
            issuer,
            timestamp,
            detail,
        } => {
            conn.execute(
                "INSERT INTO audit_logs (command, issuer, ts, recorded_at, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    command,
                    issuer,
                    *timestamp as i64,
                    chrono::Utc::now().to_rfc3339(),
                    detail,
                ],
            )?;
        }
    }
    Ok(())
}

/// Read-side access to a mirror store, used by the admin CLI and tests.
pub struct MirrorStore {
    conn: Connection,
}

impl MirrorStore {
    pub fn open(target: &MirrorTarget) -> Result<Self, CitrineError> {
        Ok(Self {
            conn: open_connection(target)?,
        })
    }

    /// Returns the address of a mirrored proxy, if present.
    pub fn proxy_address(&self, proxy_id: &str) -> Result<Option<String>, CitrineError> {
        let mut stmt = self
            .conn
            .prepare("SELECT address FROM proxies WHERE proxy_id = ?1")?;
        let mut rows = stmt.query(params![proxy_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Returns the number of audit rows recorded.
    pub fn audit_count(&self) -> Result<i64, CitrineError> {
        let count =
            self.conn
                .query_row("SELECT COUNT(*) FROM audit_logs", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Returns the mirrored partition id of a namespace, if present.
    pub fn namespace_partition(&self, name: &str) -> Result<Option<i32>, CitrineError> {
        let mut stmt = self
            .conn
            .prepare("SELECT partition_id FROM namespaces WHERE name = ?1")?;
        let mut rows = stmt.query(params![name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}
