//! Xray runner
//!
//! Config goes to the child over stdin (`-config stdin:`). Xray prints a
//! readiness line once its core is up; start only succeeds after that line
//! is seen within the startup timeout. There is no reload on the fly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::backend::process::ProcessController;
use crate::backend::runner::{Runner, StopEvent};
use crate::error::{Error, Result};

const STARTED_PATTERN: &str = r"\[Warning\] core: Xray \d+\.\d+\.\d+ started";

pub struct XrayRunner {
    controller: ProcessController,
    stop_event: Arc<StopEvent>,
    executable: PathBuf,
    assets_path: PathBuf,
    startup_timeout: Duration,
}

impl XrayRunner {
    pub fn new(
        executable: impl Into<PathBuf>,
        assets_path: impl Into<PathBuf>,
        log_buffer_size: usize,
        stop_timeout: Duration,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            controller: ProcessController::new(log_buffer_size, stop_timeout),
            stop_event: Arc::new(StopEvent::new()),
            executable: executable.into(),
            assets_path: assets_path.into(),
            startup_timeout,
        }
    }

    fn install_on_stop(&self) {
        let stop_event = self.stop_event.clone();
        self.controller.set_on_stop(move || stop_event.trigger());
    }

    /// Wait for the readiness log line, failing on deadline, on process
    /// death (subscription closed) or on a startup error.
    async fn await_startup(&self, mut logs: mpsc::Receiver<String>) -> Result<()> {
        let started = Regex::new(STARTED_PATTERN).unwrap();
        let wait = async {
            while let Some(line) = logs.recv().await {
                if started.is_match(&line) {
                    return Ok(());
                }
            }
            Err(Error::FailedToStartRunner(
                "xray process stopped unexpectedly".to_string(),
            ))
        };

        match tokio::time::timeout(self.startup_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::FailedToStartRunner(
                "startup log not found within timeout".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Runner for XrayRunner {
    async fn version(&self) -> Result<String> {
        xray_version(&self.executable).await
    }

    async fn start(&self, config: &str) -> Result<()> {
        if self.controller.is_running() {
            error!("xray runner already running");
            return Err(Error::ProcessAlreadyRunning);
        }

        let mut cmd = tokio::process::Command::new(&self.executable);
        cmd.arg("run")
            .arg("-config")
            .arg("stdin:")
            .arg("--location-asset")
            .arg(&self.assets_path)
            .env("XRAY_LOCATION_ASSET", &self.assets_path)
            .stdin(std::process::Stdio::piped());

        self.install_on_stop();

        let stdin = self
            .controller
            .setup_cmd(cmd)
            .map_err(|e| {
                error!("failed to start xray: {}", e);
                Error::FailedToStartRunner(e.to_string())
            })?
            .ok_or_else(|| Error::FailedToStartRunner("failed to get stdin pipe".to_string()))?;

        let logs = self.controller.subscribe_logs();

        let config = config.to_string();
        tokio::spawn(async move {
            let mut stdin = stdin;
            if let Err(e) = stdin.write_all(config.as_bytes()).await {
                error!("failed to write xray config to stdin: {}", e);
            }
            // Dropping stdin closes the pipe; xray starts parsing on EOF.
        });

        match self.await_startup(logs).await {
            Ok(()) => {
                info!("xray runner started");
                Ok(())
            }
            Err(e) => {
                if self.controller.is_running() {
                    let _ = self.controller.stop().await;
                }
                Err(e)
            }
        }
    }

    fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    async fn restart(&self, config: &str) -> Result<()> {
        self.controller
            .restart(|| async {
                self.stop_event.reset();
                info!("xray runner restarted");
                self.start(config).await
            })
            .await
    }

    async fn reload(&self) -> Result<()> {
        // Xray has no in-place reload.
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.controller.stop().await?;
        self.stop_event.trigger();
        info!("xray runner stopped");
        Ok(())
    }

    fn subscribe_logs(&self) -> mpsc::Receiver<String> {
        self.controller.subscribe_logs()
    }

    fn get_buffer(&self) -> Vec<String> {
        self.controller.get_buffer()
    }

    fn stop_event(&self) -> Arc<StopEvent> {
        self.stop_event.clone()
    }
}

/// Run `<exe> version` and extract the semantic version from its output.
pub async fn xray_version(executable: &std::path::Path) -> Result<String> {
    let output = tokio::process::Command::new(executable)
        .arg("version")
        .output()
        .await
        .map_err(|e| Error::FailedToGetVersion(e.to_string()))?;
    if !output.status.success() {
        return Err(Error::FailedToGetVersion(format!(
            "exit status {}",
            output.status
        )));
    }

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    parse_xray_version(&combined)
}

fn parse_xray_version(output: &str) -> Result<String> {
    let re = Regex::new(r"^Xray (\d+\.\d+\.\d+)").unwrap();
    re.captures(output)
        .map(|caps| caps[1].to_string())
        .ok_or(Error::FailedToParseVersion)
}
