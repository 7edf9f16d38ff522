use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use crate::ledger::{
    HistoryRecord, JobId, JobLedger, LedgerEntry, LedgerError, LedgerResult, LedgerStatus,
    NewLedgerEntry,
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS bd_jobs (
    job_id            INTEGER PRIMARY KEY,
    name              TEXT NOT NULL,
    status            TEXT NOT NULL,
    last_update       TEXT NOT NULL,
    endpoint_address  TEXT NOT NULL,
    site              TEXT NOT NULL,
    public_address    TEXT NOT NULL DEFAULT '',
    error_message     TEXT NOT NULL DEFAULT '',
    input_dataset     TEXT NOT NULL DEFAULT '',
    output_dataset    TEXT NOT NULL DEFAULT '',
    software          TEXT NOT NULL,
    software_version  TEXT NOT NULL,
    language          TEXT NOT NULL,
    language_version  TEXT NOT NULL,
    backend_id        TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS bd_jobs_status ON bd_jobs (status);
CREATE INDEX IF NOT EXISTS bd_jobs_status_endpoint ON bd_jobs (status, endpoint_address);

CREATE TABLE IF NOT EXISTS bd_jobs_history (
    history_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id            INTEGER NOT NULL,
    name              TEXT NOT NULL,
    status            TEXT NOT NULL,
    last_update       TEXT NOT NULL,
    endpoint_address  TEXT NOT NULL,
    site              TEXT NOT NULL,
    public_address    TEXT NOT NULL,
    error_message     TEXT NOT NULL,
    input_dataset     TEXT NOT NULL,
    output_dataset    TEXT NOT NULL,
    software          TEXT NOT NULL,
    software_version  TEXT NOT NULL,
    language          TEXT NOT NULL,
    language_version  TEXT NOT NULL,
    backend_id        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS bd_jobs_history_job ON bd_jobs_history (job_id);
"#;

const ENTRY_COLUMNS: &str = "job_id, name, status, last_update, endpoint_address, site, \
     public_address, error_message, input_dataset, output_dataset, software, \
     software_version, language, language_version, backend_id";

/// Ledger persisted in a SQLite database.
///
/// One connection serialized behind a mutex; every operation touches a
/// single job id, and status changes write the job row and its history row
/// in one transaction.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open or create a ledger database at the given path.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LedgerError::Storage(format!(
                        "creating ledger directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> LedgerResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> LedgerResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sql_id(job_id: JobId) -> i64 {
    job_id as i64
}

/// Column values as stored, before status and timestamp are parsed.
struct RawEntry {
    job_id: i64,
    name: String,
    status: String,
    last_update: String,
    endpoint_address: String,
    site: String,
    public_address: String,
    error_message: String,
    input_dataset: String,
    output_dataset: String,
    software: String,
    software_version: String,
    language: String,
    language_version: String,
    backend_id: String,
}

impl RawEntry {
    /// Read the [`ENTRY_COLUMNS`] starting at column `offset`.
    fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(offset)?,
            name: row.get(offset + 1)?,
            status: row.get(offset + 2)?,
            last_update: row.get(offset + 3)?,
            endpoint_address: row.get(offset + 4)?,
            site: row.get(offset + 5)?,
            public_address: row.get(offset + 6)?,
            error_message: row.get(offset + 7)?,
            input_dataset: row.get(offset + 8)?,
            output_dataset: row.get(offset + 9)?,
            software: row.get(offset + 10)?,
            software_version: row.get(offset + 11)?,
            language: row.get(offset + 12)?,
            language_version: row.get(offset + 13)?,
            backend_id: row.get(offset + 14)?,
        })
    }

    fn into_entry(self) -> LedgerResult<LedgerEntry> {
        let last_update = DateTime::parse_from_rfc3339(&self.last_update)
            .map_err(|e| {
                LedgerError::Storage(format!("bad timestamp '{}': {}", self.last_update, e))
            })?
            .with_timezone(&Utc);
        Ok(LedgerEntry {
            job_id: self.job_id as JobId,
            name: self.name,
            status: self.status.parse()?,
            last_update,
            endpoint_address: self.endpoint_address,
            site: self.site,
            public_address: self.public_address,
            error_message: self.error_message,
            input_dataset: self.input_dataset,
            output_dataset: self.output_dataset,
            software: self.software,
            software_version: self.software_version,
            language: self.language,
            language_version: self.language_version,
            backend_id: self.backend_id,
        })
    }
}

fn append_history(conn: &Connection, job_id: JobId) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO bd_jobs_history ({cols}) SELECT {cols} FROM bd_jobs WHERE job_id = ?1",
            cols = ENTRY_COLUMNS
        ),
        params![sql_id(job_id)],
    )?;
    Ok(())
}

fn load_entry(conn: &Connection, job_id: JobId) -> LedgerResult<Option<LedgerEntry>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM bd_jobs WHERE job_id = ?1", ENTRY_COLUMNS),
            params![sql_id(job_id)],
            |row| RawEntry::from_row(row, 0),
        )
        .optional()?;
    raw.map(RawEntry::into_entry).transpose()
}

/// Update one column of a job row, failing if the job is unknown.
fn update_field(conn: &Connection, job_id: JobId, column: &str, value: &str) -> LedgerResult<()> {
    let changed = conn.execute(
        &format!("UPDATE bd_jobs SET {} = ?1 WHERE job_id = ?2", column),
        params![value, sql_id(job_id)],
    )?;
    if changed == 0 {
        return Err(LedgerError::NotFound(job_id));
    }
    Ok(())
}

impl JobLedger for SqliteLedger {
    fn insert(&self, new: NewLedgerEntry) -> LedgerResult<LedgerEntry> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM bd_jobs WHERE job_id = ?1",
                params![sql_id(new.job_id)],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if exists {
            return Err(LedgerError::AlreadyExists(new.job_id));
        }

        let entry = LedgerEntry::from_new(new, Utc::now());
        tx.execute(
            &format!(
                "INSERT INTO bd_jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                ENTRY_COLUMNS
            ),
            params![
                sql_id(entry.job_id),
                entry.name,
                entry.status.as_str(),
                entry.last_update.to_rfc3339(),
                entry.endpoint_address,
                entry.site,
                entry.public_address,
                entry.error_message,
                entry.input_dataset,
                entry.output_dataset,
                entry.software,
                entry.software_version,
                entry.language,
                entry.language_version,
                entry.backend_id,
            ],
        )?;
        append_history(&tx, entry.job_id)?;
        tx.commit()?;
        Ok(entry)
    }

    fn get(&self, job_id: JobId) -> LedgerResult<Option<LedgerEntry>> {
        load_entry(&self.lock(), job_id)
    }

    fn set_status(&self, job_id: JobId, status: LedgerStatus) -> LedgerResult<LedgerEntry> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE bd_jobs SET status = ?1, last_update = ?2 WHERE job_id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), sql_id(job_id)],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound(job_id));
        }
        append_history(&tx, job_id)?;
        let entry = load_entry(&tx, job_id)?.ok_or(LedgerError::NotFound(job_id))?;
        tx.commit()?;
        Ok(entry)
    }

    fn set_backend_id(&self, job_id: JobId, backend_id: &str) -> LedgerResult<()> {
        update_field(&self.lock(), job_id, "backend_id", backend_id)
    }

    fn set_error(&self, job_id: JobId, message: &str) -> LedgerResult<()> {
        update_field(&self.lock(), job_id, "error_message", message)
    }

    fn jobs_by_status(&self, status: LedgerStatus) -> LedgerResult<Vec<LedgerEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM bd_jobs WHERE status = ?1 ORDER BY job_id",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str()], |row| RawEntry::from_row(row, 0))?;
        rows.map(|raw| -> LedgerResult<LedgerEntry> { raw?.into_entry() })
            .collect()
    }

    fn count_by_status_and_endpoint(
        &self,
        status: LedgerStatus,
        endpoint_address: &str,
    ) -> LedgerResult<usize> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM bd_jobs WHERE status = ?1 AND endpoint_address = ?2",
            params![status.as_str(), endpoint_address],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn history(&self, job_id: JobId) -> LedgerResult<Vec<HistoryRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT history_id, {} FROM bd_jobs_history WHERE job_id = ?1 ORDER BY history_id",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![sql_id(job_id)], |row| {
            let history_id: i64 = row.get(0)?;
            Ok((history_id, RawEntry::from_row(row, 1)?))
        })?;
        rows.map(|row| -> LedgerResult<HistoryRecord> {
            let (history_id, raw) = row?;
            Ok(HistoryRecord {
                history_id: history_id as u64,
                entry: raw.into_entry()?,
            })
        })
        .collect()
    }
}
