//! Core domain types shared by the backends, the storage layer and the
//! control service.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A server-side listener definition, identified by its tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub protocol: String,
    /// Transport/TLS/obfuscation metadata extracted from the engine config.
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// A user known to this node, together with its inbound memberships.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub key: String,
    #[serde(default)]
    pub inbounds: Vec<Inbound>,
}

impl User {
    /// The engine-visible identifier, deterministic and injective on
    /// `(id, username)`.
    pub fn identifier(&self) -> String {
        format!("{}.{}", self.id, self.username)
    }
}
