use dashmap::DashMap;

use super::keepalive::{KeepaliveHandle, KeepaliveState};
use crate::services::store::LeaseId;

// 本地持有的租约信息
#[derive(Debug, Clone)]
pub struct TrackedLease {
    pub lease_id: LeaseId,
    pub service_name: String,
    pub keepalive: KeepaliveHandle,
}

/// 实例ID -> 租约 的本地缓存
///
/// 只反映本进程注册过的实例，租约是否仍然有效以存储为准。
#[derive(Debug, Default)]
pub struct LeaseTracker {
    entries: DashMap<String, TrackedLease>,
}

impl LeaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, instance_id: String, lease: TrackedLease) -> Option<TrackedLease> {
        self.entries.insert(instance_id, lease)
    }

    pub fn get(&self, instance_id: &str) -> Option<TrackedLease> {
        self.entries.get(instance_id).map(|entry| entry.value().clone())
    }

    pub fn lease_id(&self, instance_id: &str) -> Option<LeaseId> {
        self.entries.get(instance_id).map(|entry| entry.lease_id)
    }

    pub fn keepalive_state(&self, instance_id: &str) -> Option<KeepaliveState> {
        self.entries
            .get(instance_id)
            .map(|entry| entry.keepalive.state())
    }

    pub fn remove(&self, instance_id: &str) -> Option<TrackedLease> {
        self.entries.remove(instance_id).map(|(_, lease)| lease)
    }

    /// 仅当记录仍属于 `lease_id` 时移除
    pub fn remove_if_lease(&self, instance_id: &str, lease_id: LeaseId) -> Option<TrackedLease> {
        self.entries
            .remove_if(instance_id, |_, lease| lease.lease_id == lease_id)
            .map(|(_, lease)| lease)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.entries.contains_key(instance_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
