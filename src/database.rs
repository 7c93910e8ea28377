//! Module for the durable measurement store backed by an embedded SQLite
//! database. Every accepted reading becomes one row in the append-only
//! `mesures` table; rows are never updated or deleted here (retention is
//! handled by an external cleanup job).
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Reading;

static SQL_CREATE_TABLES: &'static str = include_str!("sql/create_tables.sql");
static SQL_CREATE_INDEX: &'static str = include_str!("sql/create_index.sql");
static SQL_INSERT_MEASUREMENT: &'static str = include_str!("sql/insert_measurement.sql");

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct modeling the parameters required for the measurement database.
pub struct DatabaseParameters {
    /// Filesystem path of the SQLite database file.
    pub path: String,
}

/// Errors raised by the measurement store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing file cannot be opened, written or queried.
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
    /// The store handle was already closed.
    #[error("store is closed")]
    Closed,
}

/// Handle to the measurement database.
///
/// Owned by the pipeline thread for the lifetime of the process; the
/// connection and its prepared statements are never shared.
pub struct MeasurementStore {
    connection: Option<Connection>,
}

impl MeasurementStore {
    /// Opens the database file, creating it if absent, and applies the
    /// connection pragmas (WAL journaling, relaxed fsync, in-memory temp
    /// store, incremental auto-vacuum).
    pub fn open(parameters: &DatabaseParameters) -> Result<MeasurementStore, StoreError> {
        let connection = Connection::open(&parameters.path)?;

        // journal_mode is the one pragma that reports the resulting mode
        // back as a row.
        connection.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        connection.execute_batch(
            "PRAGMA synchronous=NORMAL; \
             PRAGMA temp_store=MEMORY; \
             PRAGMA auto_vacuum=INCREMENTAL;",
        )?;

        Ok(MeasurementStore {
            connection: Some(connection),
        })
    }

    /// Creates the schema if it does not exist yet.
    ///
    /// Idempotent: running it against an already-initialized database is
    /// a no-op and leaves existing rows untouched.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let connection = self.connection.as_ref().ok_or(StoreError::Closed)?;
        connection.execute_batch(SQL_CREATE_TABLES)?;
        connection.execute_batch(SQL_CREATE_INDEX)?;
        Ok(())
    }

    /// Appends one reading as a new row and returns its id.
    ///
    /// Uses a prepared, parameterized statement; the statement is cached
    /// on the connection so repeated inserts skip the SQL parse. Every
    /// call creates a distinct row, duplicate readings included.
    pub fn insert(&self, reading: &Reading, canonical_timestamp: &str) -> Result<i64, StoreError> {
        let connection = self.connection.as_ref().ok_or(StoreError::Closed)?;
        let mut statement = connection.prepare_cached(SQL_INSERT_MEASUREMENT)?;
        statement.execute(params![
            canonical_timestamp,
            reading.device_id,
            reading.temperature,
            reading.pressure,
            reading.humidity,
            reading.luminosity,
        ])?;
        Ok(connection.last_insert_rowid())
    }

    /// Releases the prepared statements and the connection.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub fn close(&mut self) -> Result<(), StoreError> {
        match self.connection.take() {
            Some(connection) => connection
                .close()
                .map_err(|(_, err)| StoreError::Unavailable(err)),
            None => Ok(()),
        }
    }
}
