//! Control channel handlers
//!
//! Thin wrappers: every RPC resolves a backend (or the storage) and
//! delegates. No supervision logic lives here.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use crate::backend::{ConfigPayload, VpnBackend};
use crate::models;
use crate::pb::node_service_server::{NodeService as NodeServiceTrait, NodeServiceServer};
use crate::pb::{
    users_stats, Backend, BackendConfig, BackendLogsRequest, BackendStats, BackendsResponse,
    Empty, LogLine, RestartBackendRequest, UserData, UsersData, UsersStats,
};
use crate::storage::NodeStorage;

/// The node's control service: a name-keyed set of backends plus the
/// shared storage.
pub struct NodeService {
    storage: Arc<dyn NodeStorage>,
    backends: Vec<(String, Arc<dyn VpnBackend>)>,
}

impl NodeService {
    pub fn new(storage: Arc<dyn NodeStorage>, backends: Vec<(String, Arc<dyn VpnBackend>)>) -> Self {
        Self { storage, backends }
    }

    pub fn into_server(self) -> NodeServiceServer<Self> {
        NodeServiceServer::new(self)
    }

    fn backend(&self, name: &str) -> Result<&Arc<dyn VpnBackend>, Status> {
        self.backends
            .iter()
            .find(|(backend_name, _)| backend_name == name)
            .map(|(_, backend)| backend)
            .ok_or_else(|| Status::not_found(format!("unknown backend: {}", name)))
    }

    /// Reconcile one user snapshot: diff the stored membership against the
    /// pushed one, route adds/removes to the owning backends, then persist.
    /// An empty membership removes the user.
    async fn apply_user_update(&self, update: UserData) -> Result<(), Status> {
        let Some(pb_user) = update.user else {
            return Err(Status::invalid_argument("user data without user"));
        };
        let user = models::User {
            id: pb_user.id as i64,
            username: pb_user.username,
            key: pb_user.key,
            inbounds: Vec::new(),
        };

        // Only tags this node knows can be attached.
        let mut new_inbounds = Vec::new();
        for inbound in &update.inbounds {
            match self
                .storage
                .get_inbound(&inbound.tag)
                .map_err(|e| Status::internal(e.to_string()))?
            {
                Some(known) => new_inbounds.push(known),
                None => warn!("ignoring unknown inbound tag {}", inbound.tag),
            }
        }

        let old_tags: HashSet<String> = self
            .storage
            .get_user(user.id)
            .map_err(|e| Status::internal(e.to_string()))?
            .map(|u| u.inbounds.into_iter().map(|i| i.tag).collect())
            .unwrap_or_default();
        let new_tags: HashSet<String> =
            new_inbounds.iter().map(|i| i.tag.clone()).collect();

        for inbound in &new_inbounds {
            if old_tags.contains(&inbound.tag) {
                continue;
            }
            for (_, backend) in &self.backends {
                if backend.contains_tag(&inbound.tag) {
                    backend
                        .add_user(&user, inbound)
                        .await
                        .map_err(|e| Status::internal(e.to_string()))?;
                }
            }
        }

        for tag in old_tags.difference(&new_tags) {
            let Some(inbound) = self
                .storage
                .get_inbound(tag)
                .map_err(|e| Status::internal(e.to_string()))?
            else {
                continue;
            };
            for (_, backend) in &self.backends {
                if backend.contains_tag(tag) {
                    backend
                        .remove_user(&user, &inbound)
                        .await
                        .map_err(|e| Status::internal(e.to_string()))?;
                }
            }
        }

        if new_inbounds.is_empty() {
            self.storage
                .remove_user(&user)
                .map_err(|e| Status::internal(e.to_string()))?;
        } else {
            self.storage
                .update_user_inbounds(&user, new_inbounds)
                .map_err(|e| Status::internal(e.to_string()))?;
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl NodeServiceTrait for NodeService {
    async fn sync_users(
        &self,
        request: Request<Streaming<UserData>>,
    ) -> Result<Response<Empty>, Status> {
        let mut stream = request.into_inner();
        while let Some(update) = stream.message().await? {
            self.apply_user_update(update).await?;
        }
        Ok(Response::new(Empty {}))
    }

    async fn repopulate_users(
        &self,
        request: Request<UsersData>,
    ) -> Result<Response<Empty>, Status> {
        let data = request.into_inner();

        let pushed_ids: HashSet<i64> = data
            .users_data
            .iter()
            .filter_map(|u| u.user.as_ref())
            .map(|u| u.id as i64)
            .collect();

        // Users absent from the snapshot are removed like an empty push.
        let stale: Vec<models::User> = self
            .storage
            .list_users()
            .map_err(|e| Status::internal(e.to_string()))?
            .into_iter()
            .filter(|u| !pushed_ids.contains(&u.id))
            .collect();
        for user in stale {
            self.apply_user_update(UserData {
                user: Some(crate::pb::User {
                    id: user.id as u32,
                    username: user.username.clone(),
                    key: user.key.clone(),
                }),
                inbounds: Vec::new(),
            })
            .await?;
        }

        for update in data.users_data {
            self.apply_user_update(update).await?;
        }
        info!("repopulated users");
        Ok(Response::new(Empty {}))
    }

    async fn fetch_backends(&self, _: Request<Empty>) -> Result<Response<BackendsResponse>, Status> {
        let mut backends = Vec::new();
        for (name, backend) in &self.backends {
            let version = match backend.version().await {
                Ok(version) => version,
                Err(e) => {
                    warn!("failed to get version for backend {}: {}", name, e);
                    "unknown".to_string()
                }
            };

            let inbounds = backend
                .list_inbounds()
                .iter()
                .map(|inbound| crate::pb::Inbound {
                    tag: inbound.tag.clone(),
                    config: serde_json::to_string(&inbound.config).ok(),
                })
                .collect();

            backends.push(Backend {
                name: name.clone(),
                r#type: Some(backend.backend_type().to_string()),
                version: Some(version),
                inbounds,
            });
        }
        Ok(Response::new(BackendsResponse { backends }))
    }

    async fn fetch_users_stats(&self, _: Request<Empty>) -> Result<Response<UsersStats>, Status> {
        let mut users_stats = Vec::new();
        for (_, backend) in &self.backends {
            let usages = backend
                .get_usages()
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
            for (uid, usage) in usages {
                users_stats.push(users_stats::UserStats {
                    uid: uid as u32,
                    usage: usage.max(0) as u64,
                });
            }
        }
        Ok(Response::new(UsersStats { users_stats }))
    }

    async fn fetch_backend_config(
        &self,
        request: Request<Backend>,
    ) -> Result<Response<BackendConfig>, Status> {
        let backend = self.backend(&request.into_inner().name)?;
        let configuration = backend
            .get_config()
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(BackendConfig {
            configuration,
            config_format: backend.config_format(),
        }))
    }

    async fn restart_backend(
        &self,
        request: Request<RestartBackendRequest>,
    ) -> Result<Response<Empty>, Status> {
        let request = request.into_inner();
        let backend = self.backend(&request.backend_name)?;
        let payload = request.config.map(ConfigPayload::Text);
        backend
            .restart(payload)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(Empty {}))
    }

    type StreamBackendLogsStream =
        Pin<Box<dyn Stream<Item = Result<LogLine, Status>> + Send + 'static>>;

    async fn stream_backend_logs(
        &self,
        request: Request<BackendLogsRequest>,
    ) -> Result<Response<Self::StreamBackendLogsStream>, Status> {
        let request = request.into_inner();
        let backend = self.backend(&request.backend_name)?;
        let logs = backend.get_logs(request.include_buffer).await;
        let stream = ReceiverStream::new(logs).map(|line| Ok(LogLine { line }));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_backend_stats(
        &self,
        request: Request<Backend>,
    ) -> Result<Response<BackendStats>, Status> {
        let backend = self.backend(&request.into_inner().name)?;
        Ok(Response::new(BackendStats {
            running: backend.running(),
        }))
    }
}
