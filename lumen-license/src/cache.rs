//! Persistent cache of the last-known-good license record.
//!
//! Backed by a single-row SQLite table. Writers serialize on the connection
//! and replace the row inside a transaction; readers are served from an
//! in-memory snapshot of the last committed row, so a partially written
//! record is never observable and reads never wait on disk.

use crate::error::{LicenseError, LicenseResult};
use crate::payload::SignedPayload;
use crate::record::{LicenseRecord, LicenseStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use tracing::debug;

/// Persistent store for the license record backed by SQLite.
pub struct LicenseCache {
    conn: Mutex<Connection>,
    snapshot: RwLock<Option<LicenseRecord>>,
}

impl LicenseCache {
    /// Opens (or creates) a license cache at the given path.
    pub fn open(path: impl AsRef<Path>) -> LicenseResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                LicenseError::Storage(format!("failed to create cache directory: {e}"))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| LicenseError::Storage(format!("failed to open license cache: {e}")))?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory license cache (for testing).
    pub fn open_in_memory() -> LicenseResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            LicenseError::Storage(format!("failed to open in-memory license cache: {e}"))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> LicenseResult<Self> {
        init_schema(&conn)?;
        let current = read_row(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            snapshot: RwLock::new(current),
        })
    }

    /// Returns the last committed record, if any.
    pub fn load(&self) -> LicenseResult<Option<LicenseRecord>> {
        let snapshot = self
            .snapshot
            .read()
            .map_err(|_| LicenseError::Storage("license cache snapshot poisoned".to_string()))?;
        Ok(snapshot.clone())
    }

    /// Atomically replaces the stored record.
    pub fn store(&self, record: &LicenseRecord) -> LicenseResult<()> {
        let mut conn = self.lock_conn()?;
        let features = serde_json::to_string(&record.features)?;
        let now = Utc::now().to_rfc3339();

        let tx = conn.transaction()?;
        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT id, created_at FROM license_record LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (id, created_at) =
            existing.unwrap_or_else(|| (uuid::Uuid::now_v7().to_string(), now.clone()));

        tx.execute("DELETE FROM license_record", [])?;
        tx.execute(
            "INSERT INTO license_record (
                id, license_key, status, customer_name, product, product_id, customer_id,
                features, expires_at, verified_at, issued_at, activations, max_activations,
                cached_response, device_id, is_offline, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                id,
                record.license_key,
                record.status.as_str(),
                record.customer_name,
                record.product,
                record.product_id,
                record.customer_id,
                features,
                record.expires_at.map(|t| t.to_rfc3339()),
                record.verified_at.map(|t| t.to_rfc3339()),
                record.issued_at.map(|t| t.to_rfc3339()),
                record.activations,
                record.max_activations,
                record.cached_response.as_ref().map(|p| p.as_str().to_string()),
                record.device_id,
                record.is_offline,
                created_at,
                now,
            ],
        )?;
        tx.commit()?;

        self.publish(Some(record.clone()))?;
        debug!("Stored license record ({})", record.status);
        Ok(())
    }

    /// Sets the offline flag on the stored record. No-op if nothing is stored.
    pub fn mark_offline(&self, offline: bool) -> LicenseResult<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE license_record SET is_offline = ?1, updated_at = ?2",
            params![offline, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Ok(());
        }

        let mut snapshot = self
            .snapshot
            .write()
            .map_err(|_| LicenseError::Storage("license cache snapshot poisoned".to_string()))?;
        if let Some(record) = snapshot.as_mut() {
            record.is_offline = offline;
        }
        Ok(())
    }

    /// Removes the stored record (local storage reset).
    pub fn clear(&self) -> LicenseResult<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM license_record", [])?;
        self.publish(None)
    }

    /// Re-reads the row from disk, bypassing the snapshot.
    pub fn reload(&self) -> LicenseResult<Option<LicenseRecord>> {
        let conn = self.lock_conn()?;
        let record = read_row(&conn)?;
        self.publish(record.clone())?;
        Ok(record)
    }

    fn lock_conn(&self) -> LicenseResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LicenseError::Storage("license cache connection poisoned".to_string()))
    }

    fn publish(&self, record: Option<LicenseRecord>) -> LicenseResult<()> {
        let mut snapshot = self
            .snapshot
            .write()
            .map_err(|_| LicenseError::Storage("license cache snapshot poisoned".to_string()))?;
        *snapshot = record;
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> LicenseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS license_record (
            id TEXT PRIMARY KEY,
            license_key TEXT NOT NULL,
            status TEXT NOT NULL,
            customer_name TEXT,
            product TEXT,
            product_id TEXT,
            customer_id TEXT,
            features TEXT NOT NULL,
            expires_at TEXT,
            verified_at TEXT,
            issued_at TEXT,
            activations INTEGER NOT NULL,
            max_activations INTEGER NOT NULL,
            cached_response TEXT,
            device_id TEXT,
            is_offline INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    )
    .map_err(|e| LicenseError::Storage(format!("failed to init license schema: {e}")))?;

    // Caches written before issued_at was tracked.
    if conn.prepare("SELECT issued_at FROM license_record LIMIT 0").is_err() {
        conn.execute("ALTER TABLE license_record ADD COLUMN issued_at TEXT", [])
            .map_err(|e| LicenseError::Storage(format!("failed to migrate license schema: {e}")))?;
    }
    Ok(())
}

fn read_row(conn: &Connection) -> LicenseResult<Option<LicenseRecord>> {
    let row = conn
        .query_row(
            "SELECT license_key, status, customer_name, product, product_id, customer_id,
                    features, expires_at, verified_at, issued_at, activations, max_activations,
                    cached_response, device_id, is_offline
             FROM license_record LIMIT 1",
            [],
            |row| {
                Ok(RawRow {
                    license_key: row.get(0)?,
                    status: row.get(1)?,
                    customer_name: row.get(2)?,
                    product: row.get(3)?,
                    product_id: row.get(4)?,
                    customer_id: row.get(5)?,
                    features: row.get(6)?,
                    expires_at: row.get(7)?,
                    verified_at: row.get(8)?,
                    issued_at: row.get(9)?,
                    activations: row.get(10)?,
                    max_activations: row.get(11)?,
                    cached_response: row.get(12)?,
                    device_id: row.get(13)?,
                    is_offline: row.get(14)?,
                })
            },
        )
        .optional()
        .map_err(|e| LicenseError::Storage(format!("failed to read license record: {e}")))?;

    row.map(RawRow::into_record).transpose()
}

struct RawRow {
    license_key: String,
    status: String,
    customer_name: Option<String>,
    product: Option<String>,
    product_id: Option<String>,
    customer_id: Option<String>,
    features: String,
    expires_at: Option<String>,
    verified_at: Option<String>,
    issued_at: Option<String>,
    activations: u32,
    max_activations: u32,
    cached_response: Option<String>,
    device_id: Option<String>,
    is_offline: bool,
}

impl RawRow {
    fn into_record(self) -> LicenseResult<LicenseRecord> {
        let status: LicenseStatus = self.status.parse().map_err(LicenseError::Storage)?;
        let features: BTreeSet<String> = serde_json::from_str(&self.features)?;
        Ok(LicenseRecord {
            license_key: self.license_key,
            status,
            customer_id: self.customer_id,
            customer_name: self.customer_name,
            product: self.product,
            product_id: self.product_id,
            features,
            expires_at: self.expires_at.as_deref().map(parse_time).transpose()?,
            verified_at: self.verified_at.as_deref().map(parse_time).transpose()?,
            issued_at: self.issued_at.as_deref().map(parse_time).transpose()?,
            activations: self.activations,
            max_activations: self.max_activations,
            device_id: self.device_id,
            is_offline: self.is_offline,
            cached_response: self.cached_response.map(SignedPayload::new),
        })
    }
}

fn parse_time(s: &str) -> LicenseResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LicenseError::Storage(format!("invalid timestamp {s:?}: {e}")))
}
