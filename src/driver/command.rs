//! External command driver
//!
//! Runs a user-supplied automation program once per job. The program gets the
//! job through `DOMTALLY_*` environment variables, loads the page in a traced
//! browser and leaves the trace in the output directory.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use super::{watch, Driver, Job};
use crate::config::DriverConfig;

pub struct CommandDriver {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    output_dir: PathBuf,
    poll: Duration,
    new_file_timeout: Duration,
}

impl CommandDriver {
    pub fn new(config: &DriverConfig, output_dir: PathBuf) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            output_dir,
            poll: Duration::from_millis(config.poll_interval_ms),
            new_file_timeout: Duration::from_secs(config.new_file_timeout_secs),
        }
    }

    async fn process_job(&self, job: &Job) -> Result<Option<PathBuf>> {
        let before = watch::snapshot(&self.output_dir).await?;
        let wait = serde_json::to_string(&job.wait)?;

        info!(job = %job.name, url = %job.url, "starting job");
        let status = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .env("DOMTALLY_JOB_NAME", &job.name)
            .env("DOMTALLY_JOB_URL", &job.url)
            .env("DOMTALLY_START_TRACE", job.start_trace.as_str())
            .env("DOMTALLY_WAIT", wait)
            .env("DOMTALLY_OUTPUT_DIR", &self.output_dir)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("Failed to launch driver `{}`", self.program))?;

        if !status.success() {
            // a failed navigation still leaves a usable trace most of the time
            warn!(job = %job.name, %status, "driver exited unsuccessfully");
        }

        let Some(path) =
            watch::wait_for_new_file(&self.output_dir, &before, self.poll, self.new_file_timeout)
                .await?
        else {
            warn!(job = %job.name, "no trace file appeared");
            return Ok(None);
        };
        let size = watch::wait_until_settled(&path, self.poll, self.new_file_timeout).await?;
        info!(job = %job.name, path = %path.display(), size, "trace saved");
        Ok(Some(path))
    }
}

impl Driver for CommandDriver {
    async fn process_jobs(&mut self, jobs: &[Job]) -> Result<Vec<PathBuf>> {
        let mut produced = Vec::with_capacity(jobs.len());
        for job in jobs {
            if let Some(path) = self.process_job(job).await? {
                produced.push(path);
            }
        }
        Ok(produced)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::driver::{StartTrigger, WaitCondition};

    fn job(name: &str) -> Job {
        Job {
            name: name.to_string(),
            url: format!("https://{}.test/", name),
            start_trace: StartTrigger::AfterLoad,
            wait: WaitCondition::DelayMs(0),
        }
    }

    fn driver(script: &str, dir: PathBuf) -> CommandDriver {
        let config = DriverConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            new_file_timeout_secs: 2,
            poll_interval_ms: 10,
        };
        CommandDriver::new(&config, dir)
    }

    #[tokio::test]
    async fn test_job_is_exported_and_trace_collected() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"printf '%s|%s|%s' "$DOMTALLY_JOB_URL" "$DOMTALLY_START_TRACE" "$DOMTALLY_WAIT" > "$DOMTALLY_OUTPUT_DIR/$DOMTALLY_JOB_NAME.json""#;
        let mut driver = driver(script, dir.path().to_path_buf());

        let paths = driver.process_jobs(&[job("one"), job("two")]).await.unwrap();
        assert_eq!(
            paths,
            vec![dir.path().join("one.json"), dir.path().join("two.json")]
        );
        let content = std::fs::read_to_string(&paths[0]).unwrap();
        assert_eq!(content, r#"https://one.test/|afterload|{"delay_ms":0}"#);
    }

    #[tokio::test]
    async fn test_failed_job_without_trace_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver("exit 3", dir.path().to_path_buf());

        let paths = driver.process_jobs(&[job("broken")]).await.unwrap();
        assert!(paths.is_empty());
    }
}
