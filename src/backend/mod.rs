//! The supervision kernel
//!
//! A backend is one managed engine instance: the process controller owns
//! the child, the runner speaks the engine's dialect, the backend mediates
//! orchestrator state into the live process.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Map;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::models::{Inbound, User};

pub mod process;
pub mod runner;
pub mod singbox;
pub mod xray;

pub use process::ProcessController;
pub use runner::{Runner, StopEvent};
pub use singbox::SingboxBackend;

/// A configuration pushed over the control channel. The orchestrator may
/// send it as text, raw bytes or an already-parsed document.
#[derive(Debug, Clone)]
pub enum ConfigPayload {
    Text(String),
    Bytes(Vec<u8>),
    Value(serde_json::Value),
}

impl ConfigPayload {
    /// Empty payloads mean "reuse the current config".
    pub fn is_empty(&self) -> bool {
        matches!(self, ConfigPayload::Text(s) if s.is_empty())
    }

    fn into_text(self) -> Result<String> {
        match self {
            ConfigPayload::Text(s) => Ok(s),
            ConfigPayload::Bytes(b) => String::from_utf8(b)
                .map_err(|e| Error::Config(format!("config is not valid UTF-8: {}", e))),
            ConfigPayload::Value(v) => serde_json::to_string(&v)
                .map_err(|e| Error::Config(format!("failed to encode config: {}", e))),
        }
    }

    /// Normalize to a pretty-printed JSON object.
    pub fn normalize(self) -> Result<String> {
        let text = self.into_text()?;
        let parsed: Map<String, serde_json::Value> = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse config JSON: {}", e)))?;
        serde_json::to_string_pretty(&parsed)
            .map_err(|e| Error::Config(format!("failed to format config: {}", e)))
    }
}

/// One managed engine instance, as seen by the control service.
#[async_trait]
pub trait VpnBackend: Send + Sync {
    /// Engine family name, e.g. `sing-box`.
    fn backend_type(&self) -> &'static str;

    /// Wire format of `get_config`; mirrors the control channel enum.
    fn config_format(&self) -> i32;

    async fn version(&self) -> Result<String>;

    fn running(&self) -> bool;

    /// Whether the inbound catalog currently holds this tag.
    fn contains_tag(&self, tag: &str) -> bool;

    /// Start the engine. `None` re-reads the last config from disk.
    async fn start(&self, config: Option<ConfigPayload>) -> Result<()>;

    /// Restart, with a new config or (on an empty payload) the current one.
    async fn restart(&self, config: Option<ConfigPayload>) -> Result<()>;

    async fn add_user(&self, user: &User, inbound: &Inbound) -> Result<()>;

    async fn remove_user(&self, user: &User, inbound: &Inbound) -> Result<()>;

    /// Stream engine log lines, optionally preceded by the buffered ones.
    /// Dropping the receiver ends the stream.
    async fn get_logs(&self, include_buffer: bool) -> mpsc::Receiver<String>;

    /// Per-user traffic counters since the previous call. Best effort:
    /// failures yield an empty map.
    async fn get_usages(&self) -> Result<HashMap<i64, i64>>;

    fn list_inbounds(&self) -> Vec<Inbound>;

    /// The primary config file contents, as last written.
    async fn get_config(&self) -> Result<String>;

    /// Tear down the background loops. The engine itself is left to `stop`
    /// semantics of the concrete backend.
    async fn shutdown(&self);
}
