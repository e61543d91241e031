//! In-memory user/inbound repository
//!
//! The orchestrator is the source of truth; this node only mirrors the
//! slice of state it needs to keep engines configured. Nothing here
//! survives a node restart.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::Result;
use crate::models::{Inbound, User};

/// Storage seam consumed by the backends and the control service.
pub trait NodeStorage: Send + Sync {
    fn register_inbound(&self, inbound: Inbound) -> Result<()>;
    fn remove_inbound(&self, inbound: &Inbound) -> Result<()>;
    fn remove_inbound_by_tag(&self, tag: &str) -> Result<()>;
    /// `tags = None` lists everything.
    fn list_inbounds(&self, tags: Option<&[String]>) -> Result<Vec<Inbound>>;
    fn get_inbound(&self, tag: &str) -> Result<Option<Inbound>>;

    fn list_users(&self) -> Result<Vec<User>>;
    fn get_user(&self, user_id: i64) -> Result<Option<User>>;
    /// Users whose membership includes an inbound with this tag.
    fn list_inbound_users(&self, tag: &str) -> Result<Vec<User>>;
    fn add_user(&self, user: User) -> Result<()>;
    fn remove_user(&self, user: &User) -> Result<()>;
    fn update_user_inbounds(&self, user: &User, inbounds: Vec<Inbound>) -> Result<()>;
    fn flush_users(&self) -> Result<()>;
}

#[derive(Default)]
struct StorageState {
    inbounds: HashMap<String, Inbound>,
    users: HashMap<i64, User>,
}

/// The default `NodeStorage`: two maps behind one lock.
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<StorageState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeStorage for MemoryStorage {
    fn register_inbound(&self, inbound: Inbound) -> Result<()> {
        self.state
            .write()
            .inbounds
            .insert(inbound.tag.clone(), inbound);
        Ok(())
    }

    fn remove_inbound(&self, inbound: &Inbound) -> Result<()> {
        self.state.write().inbounds.remove(&inbound.tag);
        Ok(())
    }

    fn remove_inbound_by_tag(&self, tag: &str) -> Result<()> {
        self.state.write().inbounds.remove(tag);
        Ok(())
    }

    fn list_inbounds(&self, tags: Option<&[String]>) -> Result<Vec<Inbound>> {
        let state = self.state.read();
        Ok(match tags {
            None => state.inbounds.values().cloned().collect(),
            Some(tags) => tags
                .iter()
                .filter_map(|tag| state.inbounds.get(tag).cloned())
                .collect(),
        })
    }

    fn get_inbound(&self, tag: &str) -> Result<Option<Inbound>> {
        Ok(self.state.read().inbounds.get(tag).cloned())
    }

    fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.state.read().users.values().cloned().collect())
    }

    fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        Ok(self.state.read().users.get(&user_id).cloned())
    }

    fn list_inbound_users(&self, tag: &str) -> Result<Vec<User>> {
        let state = self.state.read();
        Ok(state
            .users
            .values()
            .filter(|user| user.inbounds.iter().any(|inbound| inbound.tag == tag))
            .cloned()
            .collect())
    }

    fn add_user(&self, user: User) -> Result<()> {
        self.state.write().users.insert(user.id, user);
        Ok(())
    }

    fn remove_user(&self, user: &User) -> Result<()> {
        self.state.write().users.remove(&user.id);
        Ok(())
    }

    fn update_user_inbounds(&self, user: &User, inbounds: Vec<Inbound>) -> Result<()> {
        let mut updated = user.clone();
        updated.inbounds = inbounds;
        self.state.write().users.insert(updated.id, updated);
        Ok(())
    }

    fn flush_users(&self) -> Result<()> {
        self.state.write().users.clear();
        Ok(())
    }
}
