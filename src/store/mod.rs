//! Aggregate storage with SQLite
//!
//! Counts only ever grow: every merge is an insert-or-add keyed on the
//! decomposed source and the API label, so re-running a trace adds the same
//! amount a fresh run would.

mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use url::Url;

use crate::analyze::{ApiCounter, SourceKey};
use crate::pipeline::BatchRecord;

pub use schema::SCHEMA;

const UPSERT: &str = r#"
INSERT INTO analysis (
    firstPartyOrigin, firstPartyURL,
    thirdPartyOrigin, thirdPartyURL,
    scriptOrigin, scriptURLWOQuery, scriptURL,
    validScriptOrigin, validScriptURLWOQuery, validScriptURL,
    apiCalled, numCalls
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT (
    firstPartyOrigin, firstPartyURL,
    thirdPartyOrigin, thirdPartyURL,
    scriptOrigin, scriptURLWOQuery, scriptURL,
    validScriptOrigin, validScriptURLWOQuery, validScriptURL,
    apiCalled
) DO UPDATE SET numCalls = numCalls + excluded.numCalls"#;

/// A URL split into the forms the aggregate groups by.
///
/// Values that do not parse as absolute URLs are kept verbatim in every field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecomposedUrl {
    pub origin: String,
    pub without_query: String,
    pub url: String,
}

impl DecomposedUrl {
    pub fn new(url: Option<&str>) -> Self {
        let Some(raw) = url else {
            return Self {
                origin: String::new(),
                without_query: String::new(),
                url: String::new(),
            };
        };

        match Url::parse(raw) {
            Ok(parsed) => {
                let mut stripped = parsed.clone();
                stripped.set_query(None);
                stripped.set_fragment(None);
                Self {
                    origin: parsed.origin().ascii_serialization(),
                    without_query: stripped.to_string(),
                    url: raw.to_string(),
                }
            }
            Err(_) => Self {
                origin: raw.to_string(),
                without_query: raw.to_string(),
                url: raw.to_string(),
            },
        }
    }
}

/// The eleven-column identity of one aggregate row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateKey {
    pub first_party: DecomposedUrl,
    pub third_party: DecomposedUrl,
    pub script: DecomposedUrl,
    pub valid_script: DecomposedUrl,
    pub api: String,
}

impl AggregateKey {
    pub fn new(source: &SourceKey, api: &str) -> Self {
        Self {
            first_party: DecomposedUrl::new(source.first_party.as_deref()),
            third_party: DecomposedUrl::new(source.third_party.as_deref()),
            script: DecomposedUrl::new(source.script_url.as_deref()),
            valid_script: DecomposedUrl::new(source.valid_script_url.as_deref()),
            api: api.to_string(),
        }
    }
}

pub struct AggregateStore {
    conn: Connection,
}

impl AggregateStore {
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("Failed to initialise schema")?;
        Ok(())
    }

    // ============================================
    // AGGREGATE
    // ============================================

    /// Add `count` calls of `api` for `source`, creating the row if needed.
    pub fn upsert_increment(&self, source: &SourceKey, api: &str, count: u64) -> Result<()> {
        upsert(&self.conn, &AggregateKey::new(source, api), count)
    }

    /// Merge a whole counter in one transaction. Returns the number of rows touched.
    pub fn merge_counter(&mut self, counter: &ApiCounter) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let touched = merge_into(&tx, counter)?;
        tx.commit()?;
        Ok(touched)
    }

    /// Merge a batch's counts and write its ledger entry atomically.
    pub fn commit_batch(&mut self, batch: &BatchRecord, counter: &ApiCounter) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let rows_merged = merge_into(&tx, counter)?;

        tx.execute(
            "INSERT INTO batches (run_id, batch_index, job_count, traces_analyzed, traces_skipped,
                                  rows_merged, calls_merged, started_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                batch.run_id.to_string(),
                batch.index as i64,
                batch.job_count as i64,
                batch.analyzed() as i64,
                batch.skipped() as i64,
                rows_merged as i64,
                sql_count(counter.total_calls())?,
                batch.started_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        let batch_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO trace_files (batch_id, path, size_bytes, sha256, status, detail)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for trace in &batch.traces {
                stmt.execute(params![
                    batch_id,
                    trace.path.to_string_lossy().into_owned(),
                    sql_count(trace.size_bytes)?,
                    trace.sha256,
                    trace.status.as_str(),
                    trace.detail,
                ])?;
            }
        }

        tx.commit().context("Failed to commit batch")?;
        Ok(batch_id)
    }

    /// Current count for one source/api, `None` if never observed.
    pub fn num_calls(&self, source: &SourceKey, api: &str) -> Result<Option<i64>> {
        let key = AggregateKey::new(source, api);
        let result = self.conn.query_row(
            "SELECT numCalls FROM analysis
             WHERE firstPartyOrigin = ?1 AND firstPartyURL = ?2
               AND thirdPartyOrigin = ?3 AND thirdPartyURL = ?4
               AND scriptOrigin = ?5 AND scriptURLWOQuery = ?6 AND scriptURL = ?7
               AND validScriptOrigin = ?8 AND validScriptURLWOQuery = ?9 AND validScriptURL = ?10
               AND apiCalled = ?11",
            params![
                key.first_party.origin,
                key.first_party.url,
                key.third_party.origin,
                key.third_party.url,
                key.script.origin,
                key.script.without_query,
                key.script.url,
                key.valid_script.origin,
                key.valid_script.without_query,
                key.valid_script.url,
                key.api,
            ],
            |row| row.get(0),
        );

        match result {
            Ok(n) => Ok(Some(n)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn row_count(&self) -> Result<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM analysis", [], |row| row.get(0))?;
        Ok(n)
    }

    // ============================================
    // QUERIES
    // ============================================

    pub fn all_rows(&self) -> Result<Vec<AnalysisRow>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT firstPartyOrigin, firstPartyURL, thirdPartyOrigin, thirdPartyURL,
                      scriptOrigin, scriptURLWOQuery, scriptURL,
                      validScriptOrigin, validScriptURLWOQuery, validScriptURL,
                      apiCalled, numCalls
               FROM analysis
               ORDER BY id"#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(AnalysisRow {
                first_party_origin: row.get(0)?,
                first_party_url: row.get(1)?,
                third_party_origin: row.get(2)?,
                third_party_url: row.get(3)?,
                script_origin: row.get(4)?,
                script_url_without_query: row.get(5)?,
                script_url: row.get(6)?,
                valid_script_origin: row.get(7)?,
                valid_script_url_without_query: row.get(8)?,
                valid_script_url: row.get(9)?,
                api: row.get(10)?,
                num_calls: row.get(11)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Most called APIs per (first party origin, script origin).
    pub fn top_apis(&self, first_party: Option<&str>, limit: usize) -> Result<Vec<ApiUsageRow>> {
        let base_query = r#"SELECT firstPartyOrigin, validScriptOrigin, apiCalled,
                      SUM(numCalls) AS calls, COUNT(DISTINCT validScriptURLWOQuery) AS scripts
               FROM analysis"#;
        let tail = "GROUP BY firstPartyOrigin, validScriptOrigin, apiCalled
               ORDER BY calls DESC, apiCalled
               LIMIT ?1";

        let query = match first_party {
            Some(_) => format!("{} WHERE firstPartyOrigin = ?2 {}", base_query, tail),
            None => format!("{} {}", base_query, tail),
        };

        let mut stmt = self.conn.prepare(&query)?;

        let map_row = |row: &rusqlite::Row| -> rusqlite::Result<ApiUsageRow> {
            Ok(ApiUsageRow {
                first_party_origin: row.get(0)?,
                script_origin: row.get(1)?,
                api: row.get(2)?,
                calls: row.get(3)?,
                scripts: row.get(4)?,
            })
        };

        let limit = limit as i64;
        let rows: Vec<ApiUsageRow> = match first_party {
            Some(origin) => stmt
                .query_map(params![limit, origin], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![limit], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };

        Ok(rows)
    }

    pub fn list_batches(&self, limit: usize) -> Result<Vec<BatchRow>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT id, run_id, batch_index, job_count, traces_analyzed, traces_skipped,
                      rows_merged, calls_merged, started_at, finished_at
               FROM batches
               ORDER BY id DESC
               LIMIT ?"#,
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(BatchRow {
                id: row.get(0)?,
                run_id: row.get(1)?,
                batch_index: row.get(2)?,
                job_count: row.get(3)?,
                traces_analyzed: row.get(4)?,
                traces_skipped: row.get(5)?,
                rows_merged: row.get(6)?,
                calls_merged: row.get(7)?,
                started_at: parse_timestamp(row.get(8)?),
                finished_at: parse_timestamp(row.get(9)?),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn trace_files(&self, batch_id: i64) -> Result<Vec<TraceFileRow>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT path, size_bytes, sha256, status, detail
               FROM trace_files
               WHERE batch_id = ?
               ORDER BY id"#,
        )?;

        let rows = stmt.query_map(params![batch_id], |row| {
            Ok(TraceFileRow {
                path: row.get(0)?,
                size_bytes: row.get(1)?,
                sha256: row.get(2)?,
                status: row.get(3)?,
                detail: row.get(4)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn merge_into(conn: &Connection, counter: &ApiCounter) -> Result<usize> {
    let mut touched = 0;
    for (source, api, count) in counter.iter() {
        upsert(conn, &AggregateKey::new(source, api), count)?;
        touched += 1;
    }
    Ok(touched)
}

fn upsert(conn: &Connection, key: &AggregateKey, count: u64) -> Result<()> {
    let mut stmt = conn.prepare_cached(UPSERT)?;
    stmt.execute(params![
        key.first_party.origin,
        key.first_party.url,
        key.third_party.origin,
        key.third_party.url,
        key.script.origin,
        key.script.without_query,
        key.script.url,
        key.valid_script.origin,
        key.valid_script.without_query,
        key.valid_script.url,
        key.api,
        sql_count(count)?,
    ])
    .with_context(|| format!("Failed to record {}", key.api))?;
    Ok(())
}

fn sql_count(n: u64) -> Result<i64> {
    i64::try_from(n).context("count does not fit in an SQLite integer")
}

fn parse_timestamp(raw: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================
// ROW TYPES
// ============================================

#[derive(Debug)]
pub struct AnalysisRow {
    pub first_party_origin: String,
    pub first_party_url: String,
    pub third_party_origin: String,
    pub third_party_url: String,
    pub script_origin: String,
    pub script_url_without_query: String,
    pub script_url: String,
    pub valid_script_origin: String,
    pub valid_script_url_without_query: String,
    pub valid_script_url: String,
    pub api: String,
    pub num_calls: i64,
}

#[derive(Debug)]
pub struct ApiUsageRow {
    pub first_party_origin: String,
    pub script_origin: String,
    pub api: String,
    pub calls: i64,
    pub scripts: i64,
}

#[derive(Debug)]
pub struct BatchRow {
    pub id: i64,
    pub run_id: String,
    pub batch_index: i64,
    pub job_count: i64,
    pub traces_analyzed: i64,
    pub traces_skipped: i64,
    pub rows_merged: i64,
    pub calls_merged: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct TraceFileRow {
    pub path: String,
    pub size_bytes: i64,
    pub sha256: Option<String>,
    pub status: String,
    pub detail: Option<String>,
}
