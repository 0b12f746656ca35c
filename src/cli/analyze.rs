//! Analyze command implementation
//!
//! Analyses traces already sitting in a directory without driving a browser.

use anyhow::Result;
use std::path::PathBuf;

use super::run::print_summary;
use crate::config::{Config, Discovery};
use crate::driver::IdleDriver;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::store::AggregateStore;

pub async fn run(
    config: &Config,
    store: AggregateStore,
    dir: Option<PathBuf>,
    clear: bool,
) -> Result<()> {
    let mut options = PipelineOptions::from_config(config)?;
    options.discovery = Discovery::Directory;
    options.clear_after_analysis |= clear;
    if let Some(dir) = dir {
        options.report_dir = dir;
    }

    println!("Analysing traces in {}\n", options.report_dir.display());

    let mut pipeline = Pipeline::create(vec![], IdleDriver, store, options).await?;
    let summary = pipeline.run().await?;
    print_summary(&summary);
    Ok(())
}
