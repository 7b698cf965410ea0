//! `SQLite`-backed ledger storage implementation.
//!
//! Mirrors the key schema of the deployed onboarding table: partition key
//! `device_group`, sort key `serial_number`. Conditional writes are expressed
//! as single `INSERT OR IGNORE` / `UPDATE ... WHERE version = ?` statements,
//! so the atomicity unit is one statement and the optimistic-concurrency
//! check holds across processes as well as threads.

// SQLite returns i64 for row IDs and counts, but they're always non-negative.
// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::missing_panics_doc
)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use thiserror::Error;

use crate::record::{OnboardingRecord, OnboardingStatus};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The conditional write lost: the stored record is not at the version
    /// the writer last read (or a record already exists where the writer
    /// expected none).
    #[error(
        "version conflict for {device_group}/{serial_number}: expected version {expected_version}"
    )]
    VersionConflict {
        /// Partition key of the contested record.
        device_group: String,
        /// Sort key of the contested record.
        serial_number: String,
        /// The version the writer based its mutation on.
        expected_version: u64,
    },
}

/// Statistics about the ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerStats {
    /// Total number of onboarding records.
    pub record_count: u64,

    /// Records in terminal-success state.
    pub complete_count: u64,

    /// Records in terminal-failure state.
    pub failed_count: u64,

    /// Database size in bytes.
    pub db_size_bytes: u64,
}

/// The onboarding ledger backed by `SQLite`.
///
/// WAL mode allows concurrent reads while writes are in progress. All
/// mutations go through [`SqliteLedger::put_if_absent_or_matching_version`],
/// the single atomic conditional write the saga's concurrency model rests on.
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Opens or creates a ledger at the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize_connection(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Fetches the record for an onboarding key, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored row is malformed.
    pub fn get(
        &self,
        device_group: &str,
        serial_number: &str,
    ) -> Result<Option<OnboardingRecord>, LedgerError> {
        let conn = self.conn.lock().unwrap();

        let record = conn
            .query_row(
                "SELECT device_group, serial_number, status, version, identity_id,
                        policy_name, registry_entry_name, last_error, created_at, updated_at
                 FROM onboarding_records
                 WHERE device_group = ?1 AND serial_number = ?2",
                params![device_group, serial_number],
                row_to_record,
            )
            .optional()?;

        Ok(record)
    }

    /// The single atomic conditional write.
    ///
    /// A record at version 0 is inserted only if no row exists for its key;
    /// any other version is applied only if the stored row is still at
    /// exactly that version. Returns the new stored version on success.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::VersionConflict`] when the condition does not
    /// hold, which callers surface as "onboarding already in progress".
    pub fn put_if_absent_or_matching_version(
        &self,
        record: &OnboardingRecord,
    ) -> Result<u64, LedgerError> {
        let conn = self.conn.lock().unwrap();

        let conflict = || LedgerError::VersionConflict {
            device_group: record.device_group.clone(),
            serial_number: record.serial_number.clone(),
            expected_version: record.version,
        };

        if record.version == 0 {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO onboarding_records
                     (device_group, serial_number, status, version, identity_id,
                      policy_name, registry_entry_name, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.device_group,
                    record.serial_number,
                    record.status.as_str(),
                    record.identity_id,
                    record.policy_name,
                    record.registry_entry_name,
                    record.last_error,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            if inserted == 0 {
                return Err(conflict());
            }
            Ok(1)
        } else {
            let updated = conn.execute(
                "UPDATE onboarding_records
                 SET status = ?1, version = version + 1, identity_id = ?2,
                     policy_name = ?3, registry_entry_name = ?4, last_error = ?5,
                     updated_at = ?6
                 WHERE device_group = ?7 AND serial_number = ?8 AND version = ?9",
                params![
                    record.status.as_str(),
                    record.identity_id,
                    record.policy_name,
                    record.registry_entry_name,
                    record.last_error,
                    record.updated_at.to_rfc3339(),
                    record.device_group,
                    record.serial_number,
                    record.version as i64,
                ],
            )?;
            if updated == 0 {
                return Err(conflict());
            }
            Ok(record.version + 1)
        }
    }

    /// Removes the record for an onboarding key. Deleting an absent record
    /// is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn delete(&self, device_group: &str, serial_number: &str) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM onboarding_records WHERE device_group = ?1 AND serial_number = ?2",
            params![device_group, serial_number],
        )?;
        Ok(())
    }

    /// Lists all records of a device group, ordered by serial number.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_group(&self, device_group: &str) -> Result<Vec<OnboardingRecord>, LedgerError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT device_group, serial_number, status, version, identity_id,
                    policy_name, registry_entry_name, last_error, created_at, updated_at
             FROM onboarding_records
             WHERE device_group = ?1
             ORDER BY serial_number ASC",
        )?;

        let records = stmt
            .query_map(params![device_group], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Returns statistics about the ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the queries fail.
    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let conn = self.conn.lock().unwrap();

        let record_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM onboarding_records", [], |row| {
                row.get(0)
            })?;
        let complete_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM onboarding_records WHERE status = ?1",
            params![OnboardingStatus::Complete.as_str()],
            |row| row.get(0),
        )?;
        let failed_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM onboarding_records WHERE status = ?1",
            params![OnboardingStatus::Failed.as_str()],
            |row| row.get(0),
        )?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(LedgerStats {
            record_count: record_count as u64,
            complete_count: complete_count as u64,
            failed_count: failed_count as u64,
            db_size_bytes: (page_count * page_size) as u64,
        })
    }
}

/// Maps a row to a record, converting malformed stored values into
/// conversion errors rather than panicking.
fn row_to_record(row: &Row<'_>) -> rusqlite::Result<OnboardingRecord> {
    let status_text: String = row.get(2)?;
    let status = OnboardingStatus::parse(&status_text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    let created_at = parse_timestamp(row, 8)?;
    let updated_at = parse_timestamp(row, 9)?;

    Ok(OnboardingRecord {
        device_group: row.get(0)?,
        serial_number: row.get(1)?,
        status,
        version: row.get::<_, i64>(3)? as u64,
        identity_id: row.get(4)?,
        policy_name: row.get(5)?,
        registry_entry_name: row.get(6)?,
        last_error: row.get(7)?,
        created_at,
        updated_at,
    })
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
