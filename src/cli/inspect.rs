//! Inspect command implementation

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::analyze::{analyze_document, is_http_page, ApiCounter};
use crate::trace::TraceDocument;

/// Print the attribution of one trace as JSON, without touching the store.
pub fn run(path: &Path, all_pages: bool) -> Result<()> {
    if !path.is_file() {
        bail!("{} is not a file", path.display());
    }
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let doc = TraceDocument::from_file_bytes(path, &bytes, u64::MAX)
        .with_context(|| format!("Failed to decode {}", path.display()))?;

    let mut counter = ApiCounter::new();
    let stats = if all_pages {
        analyze_document(&doc, |_| true, &mut counter)?
    } else {
        analyze_document(&doc, is_http_page, &mut counter)?
    };

    println!("{}", serde_json::to_string_pretty(&counter.to_json())?);
    eprintln!(
        "{} threads, {} samples, {} calls attributed",
        stats.threads, stats.samples, stats.recorded
    );
    Ok(())
}
