//! Protocol accounts for sing-box inbound user entries
//!
//! Credentials are derived deterministically from the user's key: the same
//! seed always produces the same uuid/password, so a node can rebuild its
//! config from orchestrator state at any time.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::utils::{derive_password, derive_uuid};

/// XTLS flow control for vless accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XtlsFlow {
    #[default]
    None,
    Vision,
}

impl XtlsFlow {
    pub fn as_str(&self) -> &'static str {
        match self {
            XtlsFlow::None => "",
            XtlsFlow::Vision => "xtls-rprx-vision",
        }
    }
}

/// Caller-supplied credential overrides. Any field left out is derived
/// from the seed.
#[derive(Debug, Clone, Default)]
pub struct AccountOptions {
    pub uuid: Option<String>,
    pub password: Option<String>,
    pub flow: Option<XtlsFlow>,
}

/// Credential fields specific to one inbound protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Credentials {
    /// name + password: shadowsocks, trojan, hysteria2, shadowtls
    NamedPassword { password: String },
    /// name + uuid: vmess
    NamedUuid { uuid: String },
    /// name + uuid + flow: vless
    NamedUuidFlow { uuid: String, flow: XtlsFlow },
    /// name + uuid + password: tuic
    NamedUuidPassword { uuid: String, password: String },
    /// username + password: naive, socks, mixed, http
    UserPassword { password: String },
}

/// One engine-visible user entry for a sing-box inbound.
#[derive(Debug, Clone)]
pub struct Account {
    identifier: String,
    seed: String,
    credentials: Credentials,
}

impl Account {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    /// Serialize into the mapping shape sing-box expects in an inbound's
    /// `users` list.
    pub fn to_dict(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match &self.credentials {
            Credentials::NamedPassword { password } => {
                map.insert("name".into(), self.identifier.clone().into());
                map.insert("password".into(), password.clone().into());
            }
            Credentials::NamedUuid { uuid } => {
                map.insert("name".into(), self.identifier.clone().into());
                map.insert("uuid".into(), uuid.clone().into());
            }
            Credentials::NamedUuidFlow { uuid, flow } => {
                map.insert("name".into(), self.identifier.clone().into());
                map.insert("uuid".into(), uuid.clone().into());
                map.insert("flow".into(), flow.as_str().into());
            }
            Credentials::NamedUuidPassword { uuid, password } => {
                map.insert("name".into(), self.identifier.clone().into());
                map.insert("uuid".into(), uuid.clone().into());
                map.insert("password".into(), password.clone().into());
            }
            Credentials::UserPassword { password } => {
                map.insert("username".into(), self.identifier.clone().into());
                map.insert("password".into(), password.clone().into());
            }
        }
        map
    }
}

/// Build an account for the given protocol, deriving any credential not
/// overridden in `opts` from the seed.
pub fn create_account(
    protocol: &str,
    identifier: &str,
    seed: &str,
    opts: Option<&AccountOptions>,
) -> Result<Account> {
    if seed.is_empty() {
        return Err(Error::EmptySeed);
    }

    let credentials = match protocol {
        "shadowsocks" | "trojan" | "hysteria2" | "shadowtls" => Credentials::NamedPassword {
            password: password_or_derive(opts, seed),
        },
        "vmess" => Credentials::NamedUuid {
            uuid: uuid_or_derive(opts, seed),
        },
        "vless" => Credentials::NamedUuidFlow {
            uuid: uuid_or_derive(opts, seed),
            flow: opts.and_then(|o| o.flow).unwrap_or_default(),
        },
        "tuic" => Credentials::NamedUuidPassword {
            uuid: uuid_or_derive(opts, seed),
            password: password_or_derive(opts, seed),
        },
        "naive" | "socks" | "mixed" | "http" => Credentials::UserPassword {
            password: password_or_derive(opts, seed),
        },
        other => return Err(Error::UnsupportedProtocol(other.to_string())),
    };

    Ok(Account {
        identifier: identifier.to_string(),
        seed: seed.to_string(),
        credentials,
    })
}

fn uuid_or_derive(opts: Option<&AccountOptions>, seed: &str) -> String {
    opts.and_then(|o| o.uuid.clone())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| derive_uuid(seed))
}

fn password_or_derive(opts: Option<&AccountOptions>, seed: &str) -> String {
    opts.and_then(|o| o.password.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| derive_password(seed))
}
