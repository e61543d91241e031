//! Sing-box runner
//!
//! Config is delivered through a fresh temporary file per start; the
//! previous one is removed on stop or on the next start. Reload forwards
//! SIGHUP, which sing-box handles natively.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::backend::process::ProcessController;
use crate::backend::runner::{Runner, StopEvent};
use crate::error::{Error, Result};

pub struct SingboxRunner {
    controller: ProcessController,
    stop_event: Arc<StopEvent>,
    executable: PathBuf,
    config_file: Mutex<Option<PathBuf>>,
}

impl SingboxRunner {
    pub fn new(executable: impl Into<PathBuf>, log_buffer_size: usize, stop_timeout: Duration) -> Self {
        Self {
            controller: ProcessController::new(log_buffer_size, stop_timeout),
            stop_event: Arc::new(StopEvent::new()),
            executable: executable.into(),
            config_file: Mutex::new(None),
        }
    }

    fn install_on_stop(&self) {
        let stop_event = self.stop_event.clone();
        self.controller.set_on_stop(move || stop_event.trigger());
    }

    fn create_config_file(&self, config: &str) -> Result<PathBuf> {
        self.remove_config_file();

        let mut file = tempfile::Builder::new()
            .prefix("singbox-config-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| Error::Config(format!("failed to create temporary config file: {}", e)))?;
        file.write_all(config.as_bytes())
            .map_err(|e| Error::Config(format!("failed to write config to file: {}", e)))?;
        let (_, path) = file
            .keep()
            .map_err(|e| Error::Config(format!("failed to keep config file: {}", e)))?;

        info!("created temporary config file: {}", path.display());
        *self.config_file.lock() = Some(path.clone());
        Ok(path)
    }

    fn remove_config_file(&self) {
        if let Some(path) = self.config_file.lock().take() {
            match std::fs::remove_file(&path) {
                Ok(()) => info!("removed temporary config file: {}", path.display()),
                Err(e) => error!("failed to remove config file: {}", e),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn config_file_path(&self) -> Option<PathBuf> {
        self.config_file.lock().clone()
    }
}

#[async_trait]
impl Runner for SingboxRunner {
    async fn version(&self) -> Result<String> {
        singbox_version(&self.executable).await
    }

    async fn start(&self, config: &str) -> Result<()> {
        if self.controller.is_running() {
            error!("sing-box is started already");
            return Err(Error::ProcessAlreadyRunning);
        }

        let config_path = self.create_config_file(config)?;

        let mut cmd = tokio::process::Command::new(&self.executable);
        cmd.arg("run")
            .arg("--disable-color")
            .arg("-c")
            .arg(&config_path);

        self.install_on_stop();

        if let Err(e) = self.controller.setup_cmd(cmd) {
            error!("failed to start sing-box: {}", e);
            self.remove_config_file();
            return Err(e);
        }

        info!("sing-box started");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    async fn restart(&self, config: &str) -> Result<()> {
        info!("restarting sing-box");
        self.controller
            .restart(|| async {
                self.stop_event.reset();
                self.start(config).await
            })
            .await
    }

    async fn reload(&self) -> Result<()> {
        self.controller.reload(Signal::SIGHUP)
    }

    async fn stop(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        self.controller.stop().await?;

        self.remove_config_file();
        self.stop_event.trigger();

        info!("sing-box stopped");
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
pub async fn singbox_version(executable: &std::path::Path) -> Result<String> {
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
    parse_singbox_version(&combined)
}

fn parse_singbox_version(output: &str) -> Result<String> {
    let re = Regex::new(r"^sing-box version (\d+\.\d+\.\d+)").unwrap();
    re.captures(output)
        .map(|caps| caps[1].to_string())
        .ok_or(Error::FailedToParseVersion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    pub(crate) fn fake_engine(script: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    }

    fn runner(executable: PathBuf) -> SingboxRunner {
        SingboxRunner::new(executable, 100, Duration::from_millis(500))
    }

    #[test]
    fn test_parse_version_output() {
        let parsed =
            parse_singbox_version("sing-box version 1.9.3\n\nEnvironment: go1.22.4 linux/amd64\n")
                .unwrap();
        assert_eq!(parsed, "1.9.3");
    }

    #[test]
    fn test_parse_version_rejects_unrelated_output() {
        assert!(matches!(
            parse_singbox_version("Xray 1.8.24 (Xray, Penetrates Everything.)"),
            Err(Error::FailedToParseVersion)
        ));
    }

    #[tokio::test]
    async fn test_version_from_fake_engine() {
        let (_dir, exe) = fake_engine("echo 'sing-box version 1.9.3 (go1.22.4 linux/amd64)'");
        assert_eq!(runner(exe).version().await.unwrap(), "1.9.3");
    }

    #[tokio::test]
    async fn test_version_exec_failure() {
        let runner = runner(PathBuf::from("/nonexistent/sing-box"));
        assert!(matches!(
            runner.version().await,
            Err(Error::FailedToGetVersion(_))
        ));
    }

    #[tokio::test]
    async fn test_start_writes_config_and_stop_cleans_up() {
        let (_dir, exe) = fake_engine("sleep 10");
        let runner = runner(exe);
        runner.start("{\"inbounds\":[]}").await.unwrap();
        assert!(runner.is_running());

        let config_path = runner.config_file_path().unwrap();
        assert!(config_path.exists());
        assert_eq!(
            std::fs::read_to_string(&config_path).unwrap(),
            "{\"inbounds\":[]}"
        );
        assert!(!runner.stop_event().is_fired());

        runner.stop().await.unwrap();
        assert!(!runner.is_running());
        assert!(!config_path.exists());
        assert!(runner.stop_event().is_fired());
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_a_no_op() {
        let (_dir, exe) = fake_engine("sleep 10");
        let runner = runner(exe);
        runner.stop().await.unwrap();
        assert!(!runner.stop_event().is_fired());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_dir, exe) = fake_engine("sleep 10");
        let runner = runner(exe);
        runner.start("{}").await.unwrap();
        assert!(matches!(
            runner.start("{}").await,
            Err(Error::ProcessAlreadyRunning)
        ));
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_replaces_config_file() {
        let (_dir, exe) = fake_engine("sleep 10");
        let runner = runner(exe);
        runner.start("{\"a\":1}").await.unwrap();
        let first = runner.config_file_path().unwrap();

        runner.restart("{\"a\":2}").await.unwrap();
        let second = runner.config_file_path().unwrap();
        assert_ne!(first, second);
        assert!(!first.exists());
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "{\"a\":2}");
        assert!(runner.is_running());
        assert!(!runner.stop_event().is_fired());
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_death_fires_stop_event() {
        let (_dir, exe) = fake_engine("echo dying; exit 1");
        let runner = runner(exe);
        runner.start("{}").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), runner.stop_event().wait())
            .await
            .expect("stop event should fire when the engine exits");
    }
}
