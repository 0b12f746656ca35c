//! Browser automation boundary
//!
//! A driver takes page-load jobs and leaves one trace file per job in the
//! output directory. How the browser is launched and told to start and stop
//! capturing is the driver's business; the pipeline only sees finished files.

mod command;
pub mod watch;

pub use command::CommandDriver;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// When trace capture starts relative to navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartTrigger {
    BeforeLoad,
    AfterLoad,
}

impl StartTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartTrigger::BeforeLoad => "beforeload",
            StartTrigger::AfterLoad => "afterload",
        }
    }
}

impl Default for StartTrigger {
    fn default() -> Self {
        StartTrigger::BeforeLoad
    }
}

/// What the driver waits for before it stops capturing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitCondition {
    /// Fixed delay after navigation
    DelayMs(u64),
    /// Until a CSS selector matches
    Selector(String),
    /// Until a JavaScript predicate evaluated in the page returns true
    Function(String),
}

/// One page load to trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub url: String,

    #[serde(default)]
    pub start_trace: StartTrigger,

    #[serde(with = "serde_yaml::with::singleton_map")]
    pub wait: WaitCondition,
}

/// Drives a browser through jobs.
///
/// One driver value serves the whole run. Each batch opens a session through
/// `process_jobs` and ends it with `close`, so at most one browser is alive at
/// a time; the driver must accept new jobs again after `close`.
#[allow(async_fn_in_trait)]
pub trait Driver {
    /// Run each job once, best effort, returning the trace files produced.
    async fn process_jobs(&mut self, jobs: &[Job]) -> Result<Vec<PathBuf>>;

    /// End the current batch's session.
    async fn close(&mut self) -> Result<()>;
}

/// A driver that never produces anything, for analysing existing traces.
#[derive(Debug, Default)]
pub struct IdleDriver;

impl Driver for IdleDriver {
    async fn process_jobs(&mut self, _jobs: &[Job]) -> Result<Vec<PathBuf>> {
        Ok(vec![])
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
