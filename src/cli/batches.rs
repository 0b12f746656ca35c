//! Batches command implementation

use anyhow::Result;

use crate::store::AggregateStore;

pub fn run(store: &AggregateStore, limit: usize, files: bool) -> Result<()> {
    let batches = store.list_batches(limit)?;

    if batches.is_empty() {
        println!("No batches recorded yet.");
        return Ok(());
    }

    println!(
        "{:<6} {:<10} {:>5} {:>5} {:>8} {:>7} {:>7} {:>9}  {}",
        "ID", "Run", "Batch", "Jobs", "Analysed", "Skipped", "Rows", "Calls", "Finished"
    );
    println!("{}", "-".repeat(100));

    for batch in batches {
        let finished = batch
            .finished_at
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<6} {:<10} {:>5} {:>5} {:>8} {:>7} {:>7} {:>9}  {}",
            batch.id,
            &batch.run_id[..8.min(batch.run_id.len())],
            batch.batch_index,
            batch.job_count,
            batch.traces_analyzed,
            batch.traces_skipped,
            batch.rows_merged,
            batch.calls_merged,
            finished,
        );

        if files {
            for file in store.trace_files(batch.id)? {
                println!(
                    "       {:<10} {:>12}  {}{}",
                    file.status,
                    file.size_bytes,
                    file.path,
                    file.detail
                        .map(|d| format!("  ({})", d))
                        .unwrap_or_default(),
                );
            }
        }
    }

    Ok(())
}
