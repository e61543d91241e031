//! Stats client for the engine's v2ray management API
//!
//! Counter names on the wire are flat, four `>>>`-separated segments:
//! `<type>>>><name>>>><metric>>>><link>`. Shorter names are dropped.

use tonic::transport::{Channel, Endpoint};

use crate::error::{Error, Result};
use crate::pb::stats::stats_service_client::StatsServiceClient;
use crate::pb::stats::{QueryStatsRequest, SysStatsRequest};

/// One parsed counter from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatEntry {
    /// Scope of the counter: `user`, `inbound` or `outbound`.
    pub kind: String,
    /// Entity the counter belongs to (email or tag).
    pub name: String,
    /// Traffic direction: `uplink` or `downlink`.
    pub link: String,
    pub value: i64,
}

/// Engine-side runtime counters, passed through one-to-one.
#[derive(Debug, Clone, Default)]
pub struct SysStats {
    pub num_goroutine: u32,
    pub num_gc: u32,
    pub alloc: u64,
    pub total_alloc: u64,
    pub sys: u64,
    pub mallocs: u64,
    pub frees: u64,
    pub live_objects: u64,
    pub pause_total_ns: u64,
    pub uptime: u32,
}

/// Uplink/downlink byte counters folded for a single entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub name: String,
    pub uplink: i64,
    pub downlink: i64,
}

/// Client for the engine's StatsService. The channel connects lazily, so
/// construction never blocks on the engine being up.
pub struct StatsClient {
    client: StatsServiceClient<Channel>,
}

impl StatsClient {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}:{}", host, port))
            .map_err(|e| Error::Stats(format!("invalid stats endpoint: {}", e)))?;
        Ok(Self {
            client: StatsServiceClient::new(endpoint.connect_lazy()),
        })
    }

    pub async fn get_sys_stats(&self) -> Result<SysStats> {
        let response = self
            .client
            .clone()
            .get_sys_stats(SysStatsRequest {})
            .await
            .map_err(|e| Error::Stats(e.to_string()))?
            .into_inner();
        Ok(SysStats {
            num_goroutine: response.num_goroutine,
            num_gc: response.num_gc,
            alloc: response.alloc,
            total_alloc: response.total_alloc,
            sys: response.sys,
            mallocs: response.mallocs,
            frees: response.frees,
            live_objects: response.live_objects,
            pause_total_ns: response.pause_total_ns,
            uptime: response.uptime,
        })
    }

    /// Counters whose flat name starts with `pattern`, parsed and filtered.
    pub async fn query_stats(&self, pattern: &str, reset: bool) -> Result<Vec<StatEntry>> {
        let response = self
            .client
            .clone()
            .query_stats(QueryStatsRequest {
                pattern: pattern.to_string(),
                reset,
            })
            .await
            .map_err(|e| Error::Stats(e.to_string()))?
            .into_inner();
        Ok(response
            .stat
            .iter()
            .filter_map(|stat| parse_stat_name(&stat.name, stat.value))
            .collect())
    }

    pub async fn get_users_stats(&self, reset: bool) -> Result<Vec<StatEntry>> {
        self.query_stats("user>>>", reset).await
    }

    pub async fn get_inbounds_stats(&self, reset: bool) -> Result<Vec<StatEntry>> {
        self.query_stats("inbound>>>", reset).await
    }

    pub async fn get_outbounds_stats(&self, reset: bool) -> Result<Vec<StatEntry>> {
        self.query_stats("outbound>>>", reset).await
    }

    pub async fn get_user_stats(&self, email: &str, reset: bool) -> Result<TrafficStats> {
        let entries = self
            .query_stats(&format!("user>>>{}>>>", email), reset)
            .await?;
        Ok(fold_traffic(email, &entries))
    }

    pub async fn get_inbound_stats(&self, tag: &str, reset: bool) -> Result<TrafficStats> {
        let entries = self
            .query_stats(&format!("inbound>>>{}>>>", tag), reset)
            .await?;
        Ok(fold_traffic(tag, &entries))
    }

    pub async fn get_outbound_stats(&self, tag: &str, reset: bool) -> Result<TrafficStats> {
        let entries = self
            .query_stats(&format!("outbound>>>{}>>>", tag), reset)
            .await?;
        Ok(fold_traffic(tag, &entries))
    }
}

/// Split a flat counter name; names with fewer than four segments are
/// dropped silently.
fn parse_stat_name(name: &str, value: i64) -> Option<StatEntry> {
    let parts: Vec<&str> = name.split(">>>").collect();
    if parts.len() < 4 {
        return None;
    }
    Some(StatEntry {
        kind: parts[0].to_string(),
        name: parts[1].to_string(),
        link: parts[3].to_string(),
        value,
    })
}

/// Fold entries into uplink/downlink; unknown link values contribute
/// nothing.
fn fold_traffic(name: &str, entries: &[StatEntry]) -> TrafficStats {
    let mut stats = TrafficStats {
        name: name.to_string(),
        ..Default::default()
    };
    for entry in entries {
        match entry.link.as_str() {
            "uplink" => stats.uplink = entry.value,
            "downlink" => stats.downlink = entry.value,
            _ => {}
        }
    }
    stats
}
