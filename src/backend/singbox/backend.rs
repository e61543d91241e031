//! Sing-box backend - one managed engine instance
//!
//! The backend owns the parsed config tree, the inbound catalog and two
//! background loops: a debounced reload loop that folds any number of user
//! mutations into at most one engine reload per tick, and a recovery loop
//! that watches the runner's stop event and restarts the engine when it
//! dies outside of a planned restart.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info};

use crate::backend::runner::Runner;
use crate::backend::{ConfigPayload, VpnBackend};
use crate::error::{Error, Result};
use crate::models::{Inbound, User};
use crate::settings::Settings;
use crate::storage::NodeStorage;

use super::config::SingboxConfig;
use super::runner::SingboxRunner;
use super::stats::{StatEntry, StatsClient};

const RECOVERY_START_TIMEOUT: Duration = Duration::from_secs(30);
const USAGE_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct Catalog {
    inbounds: Vec<Inbound>,
    tags: HashSet<String>,
}

pub struct SingboxBackend {
    runner: Arc<SingboxRunner>,
    storage: Arc<dyn NodeStorage>,
    settings: Settings,
    config_path: PathBuf,
    full_config_path: PathBuf,
    /// The mutable config tree; also the user-mutation lock.
    config: Mutex<Option<SingboxConfig>>,
    catalog: SyncMutex<Catalog>,
    api: SyncMutex<Option<Arc<StatsClient>>>,
    /// Single-slot dirty signal; a full slot already implies a pending
    /// reload, so further tokens are discarded.
    dirty_tx: mpsc::Sender<()>,
    restart_lock: Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SingboxBackend {
    pub fn new(
        executable: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        storage: Arc<dyn NodeStorage>,
        settings: Settings,
    ) -> Arc<Self> {
        let runner = Arc::new(SingboxRunner::new(
            executable,
            settings.log_buffer_size,
            settings.stop_timeout,
        ));
        let config_path = config_path.into();
        let full_config_path = {
            let mut name = config_path.as_os_str().to_owned();
            name.push(".full");
            PathBuf::from(name)
        };

        let (dirty_tx, dirty_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = broadcast::channel(1);

        let backend = Arc::new(Self {
            runner,
            storage,
            settings,
            config_path,
            full_config_path,
            config: Mutex::new(None),
            catalog: SyncMutex::new(Catalog::default()),
            api: SyncMutex::new(None),
            dirty_tx,
            restart_lock: Mutex::new(()),
            shutdown_tx: shutdown_tx.clone(),
        });

        tokio::spawn(Self::user_update_loop(
            backend.clone(),
            dirty_rx,
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(Self::restart_on_failure_loop(
            backend.clone(),
            shutdown_tx.subscribe(),
        ));

        backend
    }

    fn save_config(&self, config: &str, full: bool) -> Result<()> {
        let path = if full {
            &self.full_config_path
        } else {
            &self.config_path
        };
        std::fs::write(path, config)
            .map_err(|e| Error::Config(format!("failed to save config: {}", e)))
    }

    /// Wakes every tick; if any user mutation signalled since the last
    /// tick, re-serializes the full config and reloads the engine.
    async fn user_update_loop(
        self: Arc<Self>,
        mut dirty_rx: mpsc::Receiver<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.settings.user_mod_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }

            debug!("checking for sing-box user modifications");
            let config_guard = self.config.lock().await;
            if dirty_rx.try_recv().is_err() {
                continue;
            }

            debug!("updating sing-box users");
            let Some(config) = config_guard.as_ref() else {
                continue;
            };
            let config_json = match config.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("failed to convert config to JSON: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.save_config(&config_json, true) {
                error!("failed to save full config: {}", e);
            }
            if let Err(e) = self.runner.reload().await {
                error!("failed to reload runner: {}", e);
            }
        }
    }

    /// Watches the runner's stop event. A planned restart holds the
    /// restart lock, so an acquirable lock means the engine died on its
    /// own.
    async fn restart_on_failure_loop(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let stop_event = self.runner.stop_event();
        let mut failed_attempts: u32 = 0;

        loop {
            tokio::select! {
                _ = stop_event.wait() => {}
                _ = shutdown.recv() => break,
            }

            match self.restart_lock.try_lock() {
                Ok(guard) => {
                    drop(guard);
                    debug!("sing-box stopped unexpectedly");
                    if !self.settings.restart_on_failure {
                        stop_event.reset();
                        continue;
                    }

                    let max_retries = self.settings.restart_on_failure_max_retries;
                    if max_retries > 0 && failed_attempts >= max_retries {
                        error!(
                            "giving up on restarting sing-box after {} failed attempts",
                            failed_attempts
                        );
                        break;
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.restart_on_failure_interval) => {}
                        _ = shutdown.recv() => break,
                    }

                    stop_event.reset();
                    match tokio::time::timeout(RECOVERY_START_TIMEOUT, self.start_inner(None))
                        .await
                    {
                        Ok(Ok(())) => failed_attempts = 0,
                        Ok(Err(e)) => {
                            error!("failed to restart sing-box: {}", e);
                            failed_attempts += 1;
                        }
                        Err(_) => {
                            error!("failed to restart sing-box: timed out");
                            failed_attempts += 1;
                        }
                    }
                }
                Err(_) => {
                    debug!("sing-box restarting as planned");
                    // Wait the planned restart out before re-arming.
                    let _ = self.restart_lock.lock().await;
                }
            }
        }
    }

    async fn start_inner(&self, backend_config: Option<ConfigPayload>) -> Result<()> {
        let config_str = match backend_config {
            None => std::fs::read_to_string(&self.config_path)
                .map_err(|e| Error::Config(format!("failed to read config: {}", e)))?,
            Some(payload) => {
                let pretty = payload.normalize()?;
                self.save_config(&pretty, false)?;
                pretty
            }
        };

        let mut config =
            SingboxConfig::new(&config_str, &self.settings.api_host, self.settings.api_port)?;

        let inbounds = config.list_inbounds();
        {
            let mut catalog = self.catalog.lock();
            catalog.inbounds = inbounds.clone();
            catalog.tags = inbounds.iter().map(|i| i.tag.clone()).collect();
        }

        for inbound in &inbounds {
            self.storage.register_inbound(inbound.clone()).map_err(|e| {
                Error::Storage(format!("failed to register inbound {}: {}", inbound.tag, e))
            })?;
        }

        for inbound in &inbounds {
            let users = self.storage.list_inbound_users(&inbound.tag).map_err(|e| {
                Error::Storage(format!(
                    "failed to list users for inbound {}: {}",
                    inbound.tag, e
                ))
            })?;
            for user in users {
                config.append_user(&user, inbound).map_err(|e| {
                    Error::Config(format!(
                        "failed to append user {} to inbound {}: {}",
                        user.username, inbound.tag, e
                    ))
                })?;
            }
        }

        let config_json = config.to_json()?;
        self.save_config(&config_json, true)?;

        let api = StatsClient::new(&self.settings.api_host, config.api_port())?;
        *self.api.lock() = Some(Arc::new(api));
        *self.config.lock().await = Some(config);

        self.runner.start(&config_json).await
    }

    async fn stop_inner(&self) -> Result<()> {
        self.runner.stop().await?;

        let inbounds = self.catalog.lock().inbounds.clone();
        for inbound in &inbounds {
            if let Err(e) = self.storage.remove_inbound(inbound) {
                error!("failed to remove inbound {}: {}", inbound.tag, e);
            }
        }

        let mut catalog = self.catalog.lock();
        catalog.inbounds.clear();
        catalog.tags.clear();
        Ok(())
    }
}

/// Sum uplink and downlink into one counter per user id. Stat names are
/// `<id>.<username>`; names without a leading integer id are skipped.
fn aggregate_user_stats(entries: &[StatEntry]) -> HashMap<i64, i64> {
    let mut usages = HashMap::new();
    for entry in entries {
        let Some(first) = entry.name.split('.').next() else {
            continue;
        };
        if let Ok(uid) = first.parse::<i64>() {
            *usages.entry(uid).or_insert(0) += entry.value;
        }
    }
    usages
}

#[async_trait]
impl VpnBackend for SingboxBackend {
    fn backend_type(&self) -> &'static str {
        "sing-box"
    }

    fn config_format(&self) -> i32 {
        crate::pb::ConfigFormat::Json as i32
    }

    async fn version(&self) -> Result<String> {
        self.runner.version().await
    }

    fn running(&self) -> bool {
        self.runner.is_running()
    }

    fn contains_tag(&self, tag: &str) -> bool {
        self.catalog.lock().tags.contains(tag)
    }

    async fn start(&self, config: Option<ConfigPayload>) -> Result<()> {
        self.start_inner(config).await
    }

    async fn restart(&self, config: Option<ConfigPayload>) -> Result<()> {
        let _guard = self.restart_lock.lock().await;

        let empty = config.as_ref().map(ConfigPayload::is_empty).unwrap_or(true);
        if empty {
            let config_json = {
                let guard = self.config.lock().await;
                let current = guard
                    .as_ref()
                    .ok_or_else(|| Error::Config("config not set".to_string()))?;
                current.to_json()?
            };
            return self.runner.restart(&config_json).await;
        }

        self.stop_inner().await?;
        self.runner.stop_event().reset();
        self.start_inner(config).await
    }

    async fn add_user(&self, user: &User, inbound: &Inbound) -> Result<()> {
        {
            let mut guard = self.config.lock().await;
            let config = guard
                .as_mut()
                .ok_or_else(|| Error::Config("config not set".to_string()))?;
            config.append_user(user, inbound)?;
        }
        let _ = self.dirty_tx.try_send(());
        Ok(())
    }

    async fn remove_user(&self, user: &User, inbound: &Inbound) -> Result<()> {
        {
            let mut guard = self.config.lock().await;
            let config = guard
                .as_mut()
                .ok_or_else(|| Error::Config("config not set".to_string()))?;
            config.pop_user(user, inbound)?;
        }
        let _ = self.dirty_tx.try_send(());
        Ok(())
    }

    async fn get_logs(&self, include_buffer: bool) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(100);
        let buffer = if include_buffer {
            self.runner.get_buffer()
        } else {
            Vec::new()
        };
        let mut live = self.runner.subscribe_logs();

        tokio::spawn(async move {
            for line in buffer {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            while let Some(line) = live.recv().await {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
        });

        rx
    }

    async fn get_usages(&self) -> Result<HashMap<i64, i64>> {
        let api = self.api.lock().clone();
        let Some(api) = api else {
            return Ok(HashMap::new());
        };

        match tokio::time::timeout(USAGE_QUERY_TIMEOUT, api.get_users_stats(true)).await {
            Ok(Ok(entries)) => Ok(aggregate_user_stats(&entries)),
            Ok(Err(e)) => {
                error!("failed to get stats: {}", e);
                Ok(HashMap::new())
            }
            Err(_) => {
                error!("failed to get stats: query timed out");
                Ok(HashMap::new())
            }
        }
    }

    fn list_inbounds(&self) -> Vec<Inbound> {
        self.catalog.lock().inbounds.clone()
    }

    async fn get_config(&self) -> Result<String> {
        std::fs::read_to_string(&self.config_path)
            .map_err(|e| Error::Config(format!("failed to read config: {}", e)))
    }

    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if self.runner.is_running() {
            if let Err(e) = self.stop_inner().await {
                error!("failed to stop sing-box during shutdown: {}", e);
            }
        }
        info!("sing-box backend shut down");
    }
}
