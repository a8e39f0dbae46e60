use std::fmt;
use std::pin::Pin;

use futures::Stream;
use thiserror::Error;

use crate::services::registry::keys;

/// 存储端租约句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// 按前缀读取得到的一条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// 存储原生的变更事件，删除事件的 value 为空
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    pub value: Vec<u8>,
}

impl WatchEvent {
    /// 从键中解析出 (服务名, 实例ID)
    pub fn instance_ref(&self) -> Option<(&str, &str)> {
        keys::parse_instance_key(&self.key)
    }
}

/// 续约确认
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub lease_id: LeaseId,
    /// 续约后剩余的 TTL（秒）
    pub ttl: i64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, StoreError>> + Send>>;

/// 续约确认流，流结束即表示续约通道已关闭
pub type KeepAliveStream = Pin<Box<dyn Stream<Item = Result<KeepAliveAck, StoreError>> + Send>>;

/// 存储后端错误类型
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("Store request timed out")]
    Timeout,

    #[error("Store client closed")]
    Closed,

    #[error("Etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
}
