//! Run command implementation

use anyhow::Result;

use crate::config::Config;
use crate::driver::CommandDriver;
use crate::pipeline::{Pipeline, PipelineOptions, RunSummary};
use crate::store::AggregateStore;

pub async fn run(config: &Config, store: AggregateStore) -> Result<()> {
    if config.jobs.is_empty() {
        println!("No jobs configured. Add some under `jobs:` in your config.");
        return Ok(());
    }

    let options = PipelineOptions::from_config(config)?;
    let driver = CommandDriver::new(&config.driver, options.report_dir.clone());

    println!(
        "Running {} jobs in batches of {} (driver: {})\n",
        config.jobs.len(),
        options.batch_size,
        config.driver.command
    );

    let mut pipeline = Pipeline::create(config.jobs.clone(), driver, store, options).await?;
    let summary = pipeline.run().await?;
    print_summary(&summary);
    Ok(())
}

pub fn print_summary(summary: &RunSummary) {
    println!("Batches:          {}", summary.batches);
    println!("Traces analysed:  {}", summary.traces_analyzed);
    println!("Traces skipped:   {}", summary.traces_skipped);
    println!("Rows merged:      {}", summary.rows_merged);
    println!("Calls merged:     {}", summary.calls_merged);
    if summary.traces_skipped > 0 {
        println!("\nSome traces were skipped; run 'domtally batches --files' for details.");
    }
    println!("\n✅ Done!");
}
