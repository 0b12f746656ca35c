//! Execution trace documents
//!
//! A trace is one profiler capture session written by the browser as JSON
//! (optionally zstd-compressed). Each subprocess record carries the pages it
//! hosted and the threads it sampled; threads store their stack, frame and
//! sample data as columnar tables whose column order is described by a
//! per-table schema.

pub mod table;

#[cfg(test)]
pub(crate) mod fixture;

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

pub use table::ThreadView;

/// Failures while decoding or walking a trace document.
///
/// Every variant is fatal for the document it came from and for nothing else.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("invalid trace JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("decompressed trace exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("failed to decompress trace: {0}")]
    Decompress(#[from] std::io::Error),

    #[error("{table} schema has no `{column}` column")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },

    #[error("{table} row {index} out of range (table has {len} rows)")]
    RowOutOfRange {
        table: &'static str,
        index: usize,
        len: usize,
    },

    #[error("{table} row {row} has no usable `{column}` cell")]
    BadCell {
        table: &'static str,
        column: &'static str,
        row: usize,
    },

    #[error("string {index} out of range (string table has {len} entries)")]
    StringOutOfRange { index: usize, len: usize },

    #[error("category {index} out of range ({len} categories)")]
    CategoryOutOfRange { index: usize, len: usize },

    #[error("stack {stack} is part of a prefix cycle")]
    StackCycle { stack: usize },

    #[error("page {window} is part of an embedder cycle")]
    EmbedderCycle { window: u64 },
}

/// One capture session.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceDocument {
    pub meta: TraceMeta,

    #[serde(default)]
    pub processes: Vec<SubprocessRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceMeta {
    /// Trace-global category list, indexed by the frame table's category column
    #[serde(default)]
    pub categories: Vec<Category>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubprocessRecord {
    #[serde(default)]
    pub pages: Option<Vec<Page>>,

    #[serde(default)]
    pub threads: Vec<Thread>,
}

/// A browsing context snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct Page {
    #[serde(rename = "innerWindowID")]
    pub inner_window_id: u64,

    pub url: String,

    /// Window id of the embedding page. Top-level pages carry `0` or nothing.
    #[serde(rename = "embedderInnerWindowID", default)]
    pub embedder_inner_window_id: Option<u64>,
}

impl Page {
    pub fn embedder(&self) -> Option<u64> {
        self.embedder_inner_window_id.filter(|id| *id != 0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thread {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(rename = "stackTable")]
    pub stack_table: Table,

    #[serde(rename = "frameTable")]
    pub frame_table: Table,

    pub samples: Table,

    #[serde(rename = "stringTable")]
    pub string_table: Vec<String>,
}

/// A columnar table: schema maps column name to tuple position.
#[derive(Debug, Clone, Deserialize)]
pub struct Table {
    pub schema: HashMap<String, usize>,

    #[serde(default)]
    pub data: Vec<Vec<Value>>,
}

impl TraceDocument {
    /// Decode a trace from raw file bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TraceError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decode a trace, unwrapping zstd first when the file name says so.
    ///
    /// Decompressed output is capped at `limit` bytes.
    pub fn from_file_bytes(path: &Path, bytes: &[u8], limit: u64) -> Result<Self, TraceError> {
        if is_zstd(path) {
            let decoder = zstd::stream::read::Decoder::new(bytes)?;
            let mut json = Vec::new();
            decoder.take(limit.saturating_add(1)).read_to_end(&mut json)?;
            if json.len() as u64 > limit {
                return Err(TraceError::TooLarge { limit });
            }
            Self::from_slice(&json)
        } else {
            Self::from_slice(bytes)
        }
    }

    /// Look up a category name by id.
    pub fn category_name(&self, index: usize) -> Option<&str> {
        self.meta.categories.get(index).map(|c| c.name.as_str())
    }
}

fn is_zstd(path: &Path) -> bool {
    path.extension().map(|e| e == "zst").unwrap_or(false)
}
