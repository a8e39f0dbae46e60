//! Lease store module
//!
//! The registry talks to its backing key-value store only through [`LeaseStore`]:
//! - `etcd`: etcd v3 backed implementation used by the server
//! - `memory`: in-process implementation with real TTL expiry
//! - `types`: shared handles, events and errors

pub mod etcd;
pub mod memory;
pub mod types;

use async_trait::async_trait;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use types::{
    KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, StoreError, WatchEvent, WatchEventKind,
    WatchStream,
};

/// 带租约能力的键值存储
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// 申请一个 TTL 为 `ttl_secs` 秒的租约
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, StoreError>;

    /// 写入键值并绑定到租约，租约过期时键被存储自行删除
    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<(), StoreError>;

    /// 撤销租约，租约不存在时返回 [`StoreError::LeaseNotFound`]
    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// 按键顺序读取前缀下的所有记录
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// 订阅前缀下的变更，丢弃返回的流即取消订阅
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError>;

    /// 打开续约流
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError>;

    /// 释放连接，之后的调用均失败
    async fn close(&self);
}
