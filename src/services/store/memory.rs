use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::LeaseStore;
use super::types::{
    KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, StoreError, WatchEvent, WatchEventKind,
    WatchStream,
};

/// 进程内的租约存储
///
/// 语义与 etcd 保持一致：键可绑定租约，租约过期或撤销时其下的键被删除并产生删除事件。
/// 过期在每次访问存储时惰性处理，因此时间推进后需要有一次调用才能观察到删除。
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    next_lease: i64,
    leases: HashMap<LeaseId, LeaseState>,
    kvs: BTreeMap<String, Entry>,
    watchers: Vec<Watcher>,
    closed: bool,
    fail_puts: bool,
    fail_revokes: bool,
}

#[derive(Debug)]
struct LeaseState {
    ttl_secs: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
    // 续约通道被切断后不再接受续约
    keepalive_severed: bool,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Inner {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease_id in expired {
            tracing::debug!(lease_id = %lease_id, "Lease expired");
            self.drop_lease(lease_id);
        }
    }

    fn drop_lease(&mut self, lease_id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&lease_id) else {
            return false;
        };
        for key in lease.keys {
            if self.kvs.remove(&key).is_some() {
                self.emit(WatchEvent {
                    kind: WatchEventKind::Delete,
                    key,
                    value: Vec::new(),
                });
            }
        }
        true
    }

    fn insert(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) {
        let previous = self.kvs.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        if let Some(old_lease) = previous.and_then(|entry| entry.lease)
            && let Some(state) = self.leases.get_mut(&old_lease)
        {
            state.keys.remove(key);
        }
        if let Some(lease) = lease
            && let Some(state) = self.leases.get_mut(&lease)
        {
            state.keys.insert(key.to_string());
        }
        self.emit(WatchEvent {
            kind: WatchEventKind::Put,
            key: key.to_string(),
            value,
        });
    }

    fn emit(&mut self, event: WatchEvent) {
        // 接收端已丢弃的订阅顺带清理
        self.watchers.retain(|watcher| {
            !event.key.starts_with(&watcher.prefix) || watcher.tx.send(event.clone()).is_ok()
        });
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 写入不绑定租约的键值
    pub fn put_raw(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        inner.purge_expired();
        inner.insert(key, value.into(), None);
        Ok(())
    }

    /// 切断租约的续约通道，模拟续约流被关闭
    pub fn sever_keep_alive(&self, lease: LeaseId) -> bool {
        let mut inner = self.lock();
        match inner.leases.get_mut(&lease) {
            Some(state) => {
                state.keepalive_severed = true;
                true
            }
            None => false,
        }
    }

    /// 打开后所有 put 均失败
    pub fn fail_puts(&self, enabled: bool) {
        self.lock().fail_puts = enabled;
    }

    /// 打开后所有 revoke 均失败，租约保持不变
    pub fn fail_revokes(&self, enabled: bool) {
        self.lock().fail_revokes = enabled;
    }

    /// 仍有接收端的监听数量
    pub fn watcher_count(&self) -> usize {
        self.lock()
            .watchers
            .iter()
            .filter(|watcher| !watcher.tx.is_closed())
            .count()
    }

    /// 当前存活的租约数量
    pub fn lease_count(&self) -> usize {
        let mut inner = self.lock();
        inner.purge_expired();
        inner.leases.len()
    }

    /// 键当前绑定的租约
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut inner = self.lock();
        inner.purge_expired();
        inner.kvs.get(key).and_then(|entry| entry.lease)
    }

    fn renew(&self, lease: LeaseId) -> Option<KeepAliveAck> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        inner.purge_expired();

        let state = inner.leases.get_mut(&lease)?;
        if state.keepalive_severed {
            return None;
        }
        state.deadline = Instant::now() + Duration::from_secs(state.ttl_secs as u64);
        Some(KeepAliveAck {
            lease_id: lease,
            ttl: state.ttl_secs,
        })
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        if ttl_secs <= 0 {
            return Err(StoreError::Unavailable(format!("invalid lease ttl: {ttl_secs}")));
        }

        let mut inner = self.lock();
        inner.ensure_open()?;
        inner.purge_expired();

        inner.next_lease += 1;
        let lease_id = LeaseId(inner.next_lease);
        inner.leases.insert(
            lease_id,
            LeaseState {
                ttl_secs,
                deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                keys: BTreeSet::new(),
                keepalive_severed: false,
            },
        );
        Ok(lease_id)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        if inner.fail_puts {
            return Err(StoreError::Unavailable("put rejected".to_string()));
        }
        inner.purge_expired();

        if !inner.leases.contains_key(&lease) {
            return Err(StoreError::LeaseNotFound(lease));
        }
        inner.insert(key, value, Some(lease));
        Ok(())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        if inner.fail_revokes {
            return Err(StoreError::Unavailable("revoke rejected".to_string()));
        }
        inner.purge_expired();

        if inner.drop_lease(lease) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        inner.purge_expired();

        Ok(inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        inner.purge_expired();

        if let Some(entry) = inner.kvs.remove(key) {
            if let Some(lease) = entry.lease
                && let Some(state) = inner.leases.get_mut(&lease)
            {
                state.keys.remove(key);
            }
            inner.emit(WatchEvent {
                kind: WatchEventKind::Delete,
                key: key.to_string(),
                value: Vec::new(),
            });
        }
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        let mut inner = self.lock();
        inner.ensure_open()?;
        inner.purge_expired();

        let (tx, rx) = mpsc::unbounded_channel();
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx).map(Ok)))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
        let period = {
            let mut inner = self.lock();
            inner.ensure_open()?;
            inner.purge_expired();
            let state = inner
                .leases
                .get(&lease)
                .ok_or(StoreError::LeaseNotFound(lease))?;
            Duration::from_secs(state.ttl_secs as u64) / 3
        };

        let state = (self.clone(), false);
        let stream = futures::stream::unfold(state, move |(store, started)| async move {
            if started {
                tokio::time::sleep(period).await;
            }
            let ack = store.renew(lease)?;
            Some((Ok(ack), (store, true)))
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.watchers.clear();
    }
}
