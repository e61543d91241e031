//! Sing-box config tree
//!
//! The engine config is a heterogeneous JSON document that evolves with
//! upstream, so it is kept as a tagged tree rather than a typed record.
//! Only three paths are ever touched: `inbounds[*]` (with each inbound's
//! `users` list), `experimental.v2ray_api.stats.users` and
//! `experimental.v2ray_api.listen`. Every access checks the shape it
//! expects; a malformed tree degrades, it never panics.

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::models::{Inbound, User};
use crate::utils::reality_public_key;

use super::account::create_account;

const SUPPORTED_PROTOCOLS: [&str; 7] = [
    "shadowsocks",
    "vmess",
    "trojan",
    "vless",
    "hysteria2",
    "tuic",
    "shadowtls",
];

/// Parsed sing-box config with the resolved inbound view and the v2ray
/// API block applied.
pub struct SingboxConfig {
    data: Map<String, Value>,
    api_host: String,
    api_port: u16,
    inbounds: Vec<Map<String, Value>>,
}

impl SingboxConfig {
    /// Accepts either inline JSON or a path to a JSON file.
    pub fn new(config: &str, api_host: &str, api_port: u16) -> Result<Self> {
        let data: Map<String, Value> = match serde_json::from_str(config) {
            Ok(data) => data,
            Err(parse_err) => {
                let file = std::fs::read_to_string(config).map_err(|file_err| {
                    Error::Config(format!(
                        "failed to parse as JSON and failed to read as file: {}, {}",
                        parse_err, file_err
                    ))
                })?;
                serde_json::from_str(&file).map_err(|e| {
                    Error::Config(format!("failed to parse file content as JSON: {}", e))
                })?
            }
        };

        let mut cfg = Self {
            data,
            api_host: api_host.to_string(),
            api_port,
            inbounds: Vec::new(),
        };
        cfg.resolve_inbounds();
        cfg.apply_api();
        Ok(cfg)
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    /// The inbound catalog extracted from the tree, one settings map per
    /// supported inbound.
    pub fn list_inbounds(&self) -> Vec<Inbound> {
        self.inbounds
            .iter()
            .map(|settings| Inbound {
                tag: settings
                    .get("tag")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                protocol: settings
                    .get("protocol")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                config: settings.clone(),
            })
            .collect()
    }

    /// Serialize the (mutated) config tree, pretty-printed.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.data)
            .map_err(|e| Error::Config(format!("failed to encode to JSON: {}", e)))
    }

    /// Append a user's account to the matching inbound's `users` list and
    /// register the identifier for stats collection.
    ///
    /// The account entry is appended unconditionally; repeated calls for
    /// the same user produce duplicate entries.
    pub fn append_user(&mut self, user: &User, inbound: &Inbound) -> Result<()> {
        let identifier = user.identifier();
        let account = create_account(&inbound.protocol, &identifier, &user.key, None)
            .map_err(|e| Error::Config(format!("failed to create account: {}", e)))?;

        let inbounds = self
            .data
            .get_mut("inbounds")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| Error::Config("inbounds not found in config".to_string()))?;

        let mut matched = false;
        for item in inbounds.iter_mut() {
            let Some(inbound_map) = item.as_object_mut() else {
                continue;
            };
            if inbound_map.get("tag").and_then(Value::as_str) != Some(inbound.tag.as_str()) {
                continue;
            }

            let users = inbound_map
                .entry("users")
                .or_insert_with(|| Value::Array(Vec::new()));
            if !users.is_array() {
                *users = Value::Array(Vec::new());
            }
            if let Some(users) = users.as_array_mut() {
                users.push(Value::Object(account.to_dict()));
            }
            matched = true;
            break;
        }

        if matched {
            self.register_stats_user(&identifier);
        }
        Ok(())
    }

    /// Remove every `users` entry of the matching inbound whose `name` or
    /// `username` equals the user's identifier. Entries that are not
    /// mappings are dropped.
    pub fn pop_user(&mut self, user: &User, inbound: &Inbound) -> Result<()> {
        let identifier = user.identifier();

        let inbounds = self
            .data
            .get_mut("inbounds")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| Error::Config("inbounds not found in config".to_string()))?;

        for item in inbounds.iter_mut() {
            let Some(inbound_map) = item.as_object_mut() else {
                continue;
            };
            if inbound_map.get("tag").and_then(Value::as_str) != Some(inbound.tag.as_str()) {
                continue;
            }

            let Some(users) = inbound_map.get("users").and_then(Value::as_array) else {
                continue;
            };
            let filtered: Vec<Value> = users
                .iter()
                .filter(|entry| {
                    let Some(user_map) = entry.as_object() else {
                        return false;
                    };
                    user_map.get("name").and_then(Value::as_str) != Some(identifier.as_str())
                        && user_map.get("username").and_then(Value::as_str)
                            != Some(identifier.as_str())
                })
                .cloned()
                .collect();
            inbound_map.insert("users".to_string(), Value::Array(filtered));
            break;
        }

        Ok(())
    }

    /// Force `experimental.v2ray_api` into the shape the stats client
    /// needs, leaving every other key untouched.
    fn apply_api(&mut self) {
        let experimental = self
            .data
            .entry("experimental")
            .or_insert_with(|| json!({}));
        if !experimental.is_object() {
            *experimental = json!({});
        }
        let experimental = experimental.as_object_mut().unwrap();

        let v2ray_api = experimental
            .entry("v2ray_api")
            .or_insert_with(|| json!({}));
        if !v2ray_api.is_object() {
            *v2ray_api = json!({});
        }
        let v2ray_api = v2ray_api.as_object_mut().unwrap();

        v2ray_api.insert(
            "listen".to_string(),
            Value::String(format!("{}:{}", self.api_host, self.api_port)),
        );

        let stats = v2ray_api.entry("stats").or_insert_with(|| json!({}));
        if !stats.is_object() {
            *stats = json!({});
        }
        let stats = stats.as_object_mut().unwrap();

        stats.insert("enabled".to_string(), Value::Bool(true));
        if !stats.contains_key("users") {
            stats.insert("users".to_string(), Value::Array(Vec::new()));
        }
    }

    /// Add the identifier to `stats.users` unless already present. The
    /// sequence is normalized to strings; other shapes are coerced away.
    fn register_stats_user(&mut self, identifier: &str) {
        let Some(stats) = self
            .data
            .get_mut("experimental")
            .and_then(|e| e.get_mut("v2ray_api"))
            .and_then(|v| v.get_mut("stats"))
            .and_then(Value::as_object_mut)
        else {
            return;
        };

        let mut users: Vec<String> = match stats.get("users") {
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        if !users.iter().any(|u| u == identifier) {
            users.push(identifier.to_string());
        }
        stats.insert(
            "users".to_string(),
            Value::Array(users.into_iter().map(Value::String).collect()),
        );
    }

    /// Build the resolved inbound view: one settings map per inbound with
    /// a supported `type` and a `tag`, everything else skipped.
    fn resolve_inbounds(&mut self) {
        let Some(inbounds) = self.data.get("inbounds").and_then(Value::as_array) else {
            return;
        };

        for item in inbounds {
            let Some(inbound) = item.as_object() else {
                continue;
            };
            let Some(protocol) = inbound.get("type").and_then(Value::as_str) else {
                continue;
            };
            let Some(tag) = inbound.get("tag").and_then(Value::as_str) else {
                continue;
            };
            if !SUPPORTED_PROTOCOLS.contains(&protocol) {
                continue;
            }

            let mut settings = Map::new();
            settings.insert("tag".into(), tag.into());
            settings.insert("protocol".into(), protocol.into());
            settings.insert(
                "port".into(),
                inbound.get("listen_port").cloned().unwrap_or(Value::Null),
            );
            settings.insert("network".into(), Value::Null);
            settings.insert("tls".into(), "none".into());
            settings.insert("sni".into(), json!([]));
            settings.insert("host".into(), json!([]));
            settings.insert("path".into(), Value::Null);
            settings.insert("header_type".into(), Value::Null);
            settings.insert("flow".into(), Value::Null);

            resolve_tls(inbound, &mut settings);
            resolve_transport(inbound, &mut settings);

            if protocol == "shadowtls" {
                if let Some(version) = inbound.get("version") {
                    settings.insert("shadowtls_version".into(), version.clone());
                }
            } else if protocol == "hysteria2" {
                resolve_hysteria2_obfs(inbound, &mut settings);
            }

            // One catalog entry per tag; a duplicate tag replaces the
            // earlier entry.
            match self
                .inbounds
                .iter_mut()
                .find(|s| s.get("tag").and_then(Value::as_str) == Some(tag))
            {
                Some(existing) => *existing = settings,
                None => self.inbounds.push(settings),
            }
        }
    }
}

fn resolve_tls(inbound: &Map<String, Value>, settings: &mut Map<String, Value>) {
    let Some(tls) = inbound.get("tls").and_then(Value::as_object) else {
        return;
    };
    if tls.get("enabled").and_then(Value::as_bool) != Some(true) {
        return;
    }
    settings.insert("tls".into(), "tls".into());

    if let Some(sni) = tls.get("server_name").and_then(Value::as_str) {
        if !sni.is_empty() {
            if let Some(list) = settings.get_mut("sni").and_then(Value::as_array_mut) {
                list.push(sni.into());
            }
        }
    }

    let Some(reality) = tls.get("reality").and_then(Value::as_object) else {
        return;
    };
    if reality.get("enabled").and_then(Value::as_bool) != Some(true) {
        return;
    }
    settings.insert("tls".into(), "reality".into());

    if let Some(private_key) = reality.get("private_key").and_then(Value::as_str) {
        if let Ok(public_key) = reality_public_key(private_key) {
            settings.insert("pbk".into(), public_key.into());
        }
    }

    let sid = reality
        .get("short_id")
        .and_then(Value::as_array)
        .and_then(|ids| ids.first())
        .and_then(Value::as_str)
        .unwrap_or("");
    settings.insert("sid".into(), sid.into());
}

fn resolve_transport(inbound: &Map<String, Value>, settings: &mut Map<String, Value>) {
    let Some(transport) = inbound.get("transport").and_then(Value::as_object) else {
        return;
    };
    let Some(network) = transport.get("type").and_then(Value::as_str) else {
        return;
    };
    settings.insert("network".into(), network.into());

    match network {
        "ws" | "httpupgrade" => {
            if let Some(path) = transport.get("path").and_then(Value::as_str) {
                settings.insert("path".into(), path.into());
            }
        }
        "http" => {
            if let Some(path) = transport.get("path").and_then(Value::as_str) {
                settings.insert("path".into(), path.into());
            }
            settings.insert("network".into(), "tcp".into());
            settings.insert("header_type".into(), "http".into());
            if let Some(host) = transport.get("host").and_then(Value::as_array) {
                let hosts: Vec<Value> = host
                    .iter()
                    .filter_map(Value::as_str)
                    .map(Value::from)
                    .collect();
                settings.insert("host".into(), Value::Array(hosts));
            }
        }
        "grpc" => {
            if let Some(service_name) = transport.get("service_name").and_then(Value::as_str) {
                settings.insert("path".into(), service_name.into());
            }
        }
        _ => {}
    }
}

fn resolve_hysteria2_obfs(inbound: &Map<String, Value>, settings: &mut Map<String, Value>) {
    let Some(obfs) = inbound.get("obfs").and_then(Value::as_object) else {
        return;
    };
    let Some(obfs_type) = obfs.get("type").and_then(Value::as_str) else {
        return;
    };
    // The password sits next to the type in sing-box configs; older
    // documents nest it under a key named after the type.
    let password = obfs.get("password").and_then(Value::as_str).or_else(|| {
        obfs.get(obfs_type)
            .and_then(Value::as_object)
            .and_then(|nested| nested.get("password"))
            .and_then(Value::as_str)
    });
    let Some(password) = password else {
        return;
    };
    settings.insert("header_type".into(), obfs_type.into());
    settings.insert("path".into(), password.into());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inbound(extra: Value) -> String {
        let mut inbound = json!({
            "type": "vless",
            "tag": "vless-in",
            "listen": "::",
            "listen_port": 8443,
        });
        if let (Some(base), Some(extra)) = (inbound.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        json!({ "inbounds": [inbound] }).to_string()
    }

    fn parse(config: &str) -> SingboxConfig {
        SingboxConfig::new(config, "127.0.0.1", 8081).unwrap()
    }

    fn single_settings(cfg: &SingboxConfig) -> Map<String, Value> {
        let inbounds = cfg.list_inbounds();
        assert_eq!(inbounds.len(), 1);
        inbounds[0].config.clone()
    }

    fn user() -> User {
        User {
            id: 1,
            username: "alice".to_string(),
            key: "seed-key".to_string(),
            inbounds: vec![],
        }
    }

    fn vless_inbound() -> Inbound {
        Inbound {
            tag: "vless-in".to_string(),
            protocol: "vless".to_string(),
            config: Map::new(),
        }
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(SingboxConfig::new("not json and not a path", "127.0.0.1", 8081).is_err());
    }

    #[test]
    fn test_reads_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write as _;
        write!(file, "{}", sample_inbound(json!({}))).unwrap();
        let cfg = SingboxConfig::new(file.path().to_str().unwrap(), "127.0.0.1", 8081).unwrap();
        assert_eq!(cfg.list_inbounds().len(), 1);
    }

    #[test]
    fn test_unsupported_and_untagged_inbounds_are_skipped() {
        let config = json!({
            "inbounds": [
                {"type": "vmess", "tag": "a"},
                {"type": "wireguard", "tag": "b"},
                {"type": "trojan"},
                {"tag": "no-type"},
                "not an object",
                {"type": "tuic", "tag": "c"},
            ]
        })
        .to_string();
        let cfg = parse(&config);
        let tags: Vec<String> = cfg.list_inbounds().iter().map(|i| i.tag.clone()).collect();
        assert_eq!(tags, vec!["a", "c"]);
    }

    #[test]
    fn test_duplicate_tags_resolve_to_one_entry() {
        let config = json!({
            "inbounds": [
                {"type": "vmess", "tag": "dup", "listen_port": 1},
                {"type": "vmess", "tag": "dup", "listen_port": 2},
            ]
        })
        .to_string();
        let cfg = parse(&config);
        let inbounds = cfg.list_inbounds();
        assert_eq!(inbounds.len(), 1);
        assert_eq!(inbounds[0].config.get("port").unwrap(), 2);
    }

    #[test]
    fn test_basic_settings_shape() {
        let cfg = parse(&sample_inbound(json!({})));
        let settings = single_settings(&cfg);
        assert_eq!(settings.get("tag").unwrap(), "vless-in");
        assert_eq!(settings.get("protocol").unwrap(), "vless");
        assert_eq!(settings.get("port").unwrap(), 8443);
        assert_eq!(settings.get("tls").unwrap(), "none");
        assert_eq!(settings.get("sni").unwrap(), &json!([]));
        assert_eq!(settings.get("network").unwrap(), &Value::Null);
    }

    #[test]
    fn test_tls_enabled_collects_sni() {
        let cfg = parse(&sample_inbound(json!({
            "tls": {"enabled": true, "server_name": "example.com"}
        })));
        let settings = single_settings(&cfg);
        assert_eq!(settings.get("tls").unwrap(), "tls");
        assert_eq!(settings.get("sni").unwrap(), &json!(["example.com"]));
    }

    #[test]
    fn test_tls_disabled_stays_none() {
        let cfg = parse(&sample_inbound(json!({
            "tls": {"enabled": false, "server_name": "example.com"}
        })));
        assert_eq!(single_settings(&cfg).get("tls").unwrap(), "none");
    }

    #[test]
    fn test_reality_derives_public_key_and_short_id() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine as _;
        let private_key = URL_SAFE_NO_PAD.encode([9u8; 32]);
        let cfg = parse(&sample_inbound(json!({
            "tls": {
                "enabled": true,
                "reality": {
                    "enabled": true,
                    "private_key": private_key,
                    "short_id": ["0123abcd"],
                }
            }
        })));
        let settings = single_settings(&cfg);
        assert_eq!(settings.get("tls").unwrap(), "reality");
        assert_eq!(settings.get("sid").unwrap(), "0123abcd");
        let pbk = settings.get("pbk").and_then(Value::as_str).unwrap();
        assert_eq!(pbk, reality_public_key(&URL_SAFE_NO_PAD.encode([9u8; 32])).unwrap());
    }

    #[test]
    fn test_reality_with_bad_key_omits_pbk() {
        let cfg = parse(&sample_inbound(json!({
            "tls": {
                "enabled": true,
                "reality": {"enabled": true, "private_key": "!!!", "short_id": [7]}
            }
        })));
        let settings = single_settings(&cfg);
        assert_eq!(settings.get("tls").unwrap(), "reality");
        assert!(settings.get("pbk").is_none());
        // Non-string first short_id entry collapses to the empty string.
        assert_eq!(settings.get("sid").unwrap(), "");
    }

    #[test]
    fn test_ws_transport_copies_path() {
        let cfg = parse(&sample_inbound(json!({
            "transport": {"type": "ws", "path": "/stream"}
        })));
        let settings = single_settings(&cfg);
        assert_eq!(settings.get("network").unwrap(), "ws");
        assert_eq!(settings.get("path").unwrap(), "/stream");
    }

    #[test]
    fn test_grpc_transport_maps_service_name_to_path() {
        let cfg = parse(&sample_inbound(json!({
            "transport": {"type": "grpc", "service_name": "TunService"}
        })));
        let settings = single_settings(&cfg);
        assert_eq!(settings.get("network").unwrap(), "grpc");
        assert_eq!(settings.get("path").unwrap(), "TunService");
    }

    #[test]
    fn test_http_transport_rewrites_network_and_hosts() {
        let cfg = parse(&sample_inbound(json!({
            "transport": {
                "type": "http",
                "path": "/h",
                "host": ["a.example.com", 42, "b.example.com"],
            }
        })));
        let settings = single_settings(&cfg);
        assert_eq!(settings.get("network").unwrap(), "tcp");
        assert_eq!(settings.get("header_type").unwrap(), "http");
        assert_eq!(settings.get("path").unwrap(), "/h");
        assert_eq!(
            settings.get("host").unwrap(),
            &json!(["a.example.com", "b.example.com"])
        );
    }

    #[test]
    fn test_shadowtls_copies_version() {
        let config = json!({
            "inbounds": [{"type": "shadowtls", "tag": "stls", "version": 3}]
        })
        .to_string();
        let cfg = parse(&config);
        assert_eq!(single_settings(&cfg).get("shadowtls_version").unwrap(), 3);
    }

    #[test]
    fn test_hysteria2_obfs_requires_type_and_password() {
        let config = json!({
            "inbounds": [{
                "type": "hysteria2",
                "tag": "hy2",
                "obfs": {"type": "salamander", "password": "obfs-pass"},
            }]
        })
        .to_string();
        let cfg = parse(&config);
        let settings = single_settings(&cfg);
        assert_eq!(settings.get("header_type").unwrap(), "salamander");
        assert_eq!(settings.get("path").unwrap(), "obfs-pass");

        let partial = json!({
            "inbounds": [{
                "type": "hysteria2",
                "tag": "hy2",
                "obfs": {"type": "salamander"},
            }]
        })
        .to_string();
        let cfg = parse(&partial);
        assert_eq!(single_settings(&cfg).get("header_type").unwrap(), &Value::Null);
    }

    #[test]
    fn test_hysteria2_obfs_nested_password_shape() {
        let config = json!({
            "inbounds": [{
                "type": "hysteria2",
                "tag": "hy2",
                "obfs": {"type": "salamander", "salamander": {"password": "nested-pass"}},
            }]
        })
        .to_string();
        let cfg = parse(&config);
        let settings = single_settings(&cfg);
        assert_eq!(settings.get("header_type").unwrap(), "salamander");
        assert_eq!(settings.get("path").unwrap(), "nested-pass");
    }

    #[test]
    fn test_api_block_applied_without_disturbing_siblings() {
        let config = json!({
            "inbounds": [],
            "experimental": {
                "cache_file": {"enabled": true},
                "v2ray_api": {"stats": {"users": ["kept"]}},
            }
        })
        .to_string();
        let cfg = parse(&config);
        let rendered: Value = serde_json::from_str(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(
            rendered["experimental"]["v2ray_api"]["listen"],
            "127.0.0.1:8081"
        );
        assert_eq!(rendered["experimental"]["v2ray_api"]["stats"]["enabled"], true);
        assert_eq!(
            rendered["experimental"]["v2ray_api"]["stats"]["users"],
            json!(["kept"])
        );
        assert_eq!(rendered["experimental"]["cache_file"]["enabled"], true);
    }

    #[test]
    fn test_append_user_adds_account_and_stats_entry() {
        let mut cfg = parse(&sample_inbound(json!({})));
        cfg.append_user(&user(), &vless_inbound()).unwrap();

        let rendered: Value = serde_json::from_str(&cfg.to_json().unwrap()).unwrap();
        let users = rendered["inbounds"][0]["users"].as_array().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["name"], "1.alice");
        assert!(users[0]["uuid"].is_string());
        assert_eq!(
            rendered["experimental"]["v2ray_api"]["stats"]["users"],
            json!(["1.alice"])
        );
    }

    #[test]
    fn test_append_user_twice_duplicates_entry_but_not_stats() {
        let mut cfg = parse(&sample_inbound(json!({})));
        cfg.append_user(&user(), &vless_inbound()).unwrap();
        cfg.append_user(&user(), &vless_inbound()).unwrap();

        let rendered: Value = serde_json::from_str(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(rendered["inbounds"][0]["users"].as_array().unwrap().len(), 2);
        assert_eq!(
            rendered["experimental"]["v2ray_api"]["stats"]["users"],
            json!(["1.alice"])
        );
    }

    #[test]
    fn test_append_user_without_inbounds_fails() {
        let mut cfg = parse(&json!({"log": {}}).to_string());
        // apply_api only creates the experimental block, not inbounds
        let err = cfg.append_user(&user(), &vless_inbound()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_append_user_unknown_protocol_fails() {
        let mut cfg = parse(&sample_inbound(json!({})));
        let inbound = Inbound {
            tag: "vless-in".to_string(),
            protocol: "wireguard".to_string(),
            config: Map::new(),
        };
        let err = cfg.append_user(&user(), &inbound).unwrap_err();
        assert!(err.to_string().contains("Unsupported protocol"));
    }

    #[test]
    fn test_pop_user_removes_matching_entries() {
        let mut cfg = parse(&sample_inbound(json!({})));
        cfg.append_user(&user(), &vless_inbound()).unwrap();
        cfg.append_user(&user(), &vless_inbound()).unwrap();
        let other = User {
            id: 2,
            username: "bob".to_string(),
            key: "other-key".to_string(),
            inbounds: vec![],
        };
        cfg.append_user(&other, &vless_inbound()).unwrap();

        cfg.pop_user(&user(), &vless_inbound()).unwrap();

        let rendered: Value = serde_json::from_str(&cfg.to_json().unwrap()).unwrap();
        let users = rendered["inbounds"][0]["users"].as_array().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["name"], "2.bob");
    }

    #[test]
    fn test_pop_user_drops_non_mapping_entries() {
        let config = json!({
            "inbounds": [{
                "type": "vless",
                "tag": "vless-in",
                "users": ["stray", {"name": "2.bob", "uuid": "u"}],
            }]
        })
        .to_string();
        let mut cfg = parse(&config);
        cfg.pop_user(&user(), &vless_inbound()).unwrap();
        let rendered: Value = serde_json::from_str(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(
            rendered["inbounds"][0]["users"],
            json!([{"name": "2.bob", "uuid": "u"}])
        );
    }

    #[test]
    fn test_serialize_reparse_pop_keeps_stats_identifier() {
        let mut cfg = parse(&sample_inbound(json!({})));
        cfg.append_user(&user(), &vless_inbound()).unwrap();

        let mut reparsed = parse(&cfg.to_json().unwrap());
        reparsed.pop_user(&user(), &vless_inbound()).unwrap();

        let rendered: Value = serde_json::from_str(&reparsed.to_json().unwrap()).unwrap();
        assert_eq!(rendered["inbounds"][0]["users"], json!([]));
        // Only users lists are mutated by pop; the stats registration stays.
        assert_eq!(
            rendered["experimental"]["v2ray_api"]["stats"]["users"],
            json!(["1.alice"])
        );
    }

    #[test]
    fn test_stats_users_coerced_to_string_sequence() {
        let config = json!({
            "inbounds": [{"type": "vless", "tag": "vless-in"}],
            "experimental": {"v2ray_api": {"stats": {"users": "not a list"}}},
        })
        .to_string();
        let mut cfg = parse(&config);
        cfg.append_user(&user(), &vless_inbound()).unwrap();
        let rendered: Value = serde_json::from_str(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(
            rendered["experimental"]["v2ray_api"]["stats"]["users"],
            json!(["1.alice"])
        );
    }
}
