//! Read-only view of cluster membership consumed by the failure detector.
//!
//! Membership itself is managed elsewhere; the detector only asks who the
//! members are (in canonical order), who it is, and who holds a role.

use crate::InstanceId;
use std::collections::HashMap;
use std::sync::RwLock;

/// Role held by the instance coordinating the cluster.
pub const COORDINATOR: &str = "coordinator";

/// Membership view.
pub trait ClusterView: Send + Sync {
    /// Members in canonical order.
    fn members(&self) -> Vec<InstanceId>;

    /// This instance.
    fn me(&self) -> InstanceId;

    /// Current holder of `role`, if one has been elected.
    fn elected(&self, role: &str) -> Option<InstanceId>;

    fn is_member(&self, id: InstanceId) -> bool {
        self.members().contains(&id)
    }

    fn is_me(&self, id: InstanceId) -> bool {
        self.me() == id
    }
}

/// Snapshot of a cluster's configuration as seen by one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfiguration {
    me: InstanceId,
    members: Vec<InstanceId>,
    roles: HashMap<String, InstanceId>,
}

impl ClusterConfiguration {
    /// Create a configuration. Duplicate members keep their first position.
    pub fn new(me: InstanceId, members: impl IntoIterator<Item = InstanceId>) -> Self {
        let mut config = Self {
            me,
            members: Vec::new(),
            roles: HashMap::new(),
        };
        for member in members {
            config.join(member);
        }
        config
    }

    /// Append a member at the end of the canonical order.
    ///
    /// Returns false if it was already a member.
    pub fn join(&mut self, id: InstanceId) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        self.members.push(id);
        true
    }

    /// Remove a member and any roles it held.
    pub fn leave(&mut self, id: InstanceId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| *m != id);
        self.roles.retain(|_, holder| *holder != id);
        self.members.len() != before
    }

    pub fn elect(&mut self, role: impl Into<String>, id: InstanceId) {
        self.roles.insert(role.into(), id);
    }

    pub fn unelect(&mut self, role: &str) -> Option<InstanceId> {
        self.roles.remove(role)
    }
}

impl ClusterView for ClusterConfiguration {
    fn members(&self) -> Vec<InstanceId> {
        self.members.clone()
    }

    fn me(&self) -> InstanceId {
        self.me
    }

    fn elected(&self, role: &str) -> Option<InstanceId> {
        self.roles.get(role).copied()
    }
}

/// Configuration shared between the detector and whatever manages
/// membership.
#[derive(Debug)]
pub struct SharedClusterConfiguration {
    inner: RwLock<ClusterConfiguration>,
}

impl SharedClusterConfiguration {
    pub fn new(config: ClusterConfiguration) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    /// Apply a change to the configuration.
    pub fn update<R>(&self, change: impl FnOnce(&mut ClusterConfiguration) -> R) -> R {
        change(&mut self.inner.write().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn snapshot(&self) -> ClusterConfiguration {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ClusterView for SharedClusterConfiguration {
    fn members(&self) -> Vec<InstanceId> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).members()
    }

    fn me(&self) -> InstanceId {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).me()
    }

    fn elected(&self, role: &str) -> Option<InstanceId> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .elected(role)
    }
}
