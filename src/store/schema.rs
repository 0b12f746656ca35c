//! SQLite schema definition
//!
//! - analysis: cumulative API call counts, one row per decomposed source + api
//! - batches / trace_files: ledger of what each committed batch looked at

pub const SCHEMA: &str = r#"
-- ============================================
-- AGGREGATE
-- ============================================

-- Absent URL parts are stored as '' so the unique index treats them as equal.
CREATE TABLE IF NOT EXISTS analysis (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    firstPartyOrigin TEXT NOT NULL,
    firstPartyURL TEXT NOT NULL,
    thirdPartyOrigin TEXT NOT NULL,
    thirdPartyURL TEXT NOT NULL,
    scriptOrigin TEXT NOT NULL,
    scriptURLWOQuery TEXT NOT NULL,
    scriptURL TEXT NOT NULL,
    validScriptOrigin TEXT NOT NULL,
    validScriptURLWOQuery TEXT NOT NULL,
    validScriptURL TEXT NOT NULL,
    apiCalled TEXT NOT NULL,
    numCalls INTEGER NOT NULL
) STRICT;

CREATE UNIQUE INDEX IF NOT EXISTS idx_source
ON analysis (
    firstPartyOrigin,
    firstPartyURL,
    thirdPartyOrigin,
    thirdPartyURL,
    scriptOrigin,
    scriptURLWOQuery,
    scriptURL,
    validScriptOrigin,
    validScriptURLWOQuery,
    validScriptURL,
    apiCalled
);

-- ============================================
-- LEDGER
-- ============================================

CREATE TABLE IF NOT EXISTS batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,                  -- UUID shared by all batches of one run
    batch_index INTEGER NOT NULL,
    job_count INTEGER NOT NULL,
    traces_analyzed INTEGER NOT NULL,
    traces_skipped INTEGER NOT NULL,
    rows_merged INTEGER NOT NULL,
    calls_merged INTEGER NOT NULL,
    started_at DATETIME NOT NULL,
    finished_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS trace_files (
    id INTEGER PRIMARY KEY,
    batch_id INTEGER NOT NULL,
    path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    sha256 TEXT,                           -- NULL when the file was never read
    status TEXT NOT NULL,                  -- 'analyzed', 'oversized', 'unreadable', 'corrupt'
    detail TEXT,
    FOREIGN KEY(batch_id) REFERENCES batches(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_analysis_api ON analysis(apiCalled);
CREATE INDEX IF NOT EXISTS idx_trace_files_batch ON trace_files(batch_id);
"#;
