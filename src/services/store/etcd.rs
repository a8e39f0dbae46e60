use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    WatchOptions, Watcher,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::LeaseStore;
use super::types::{
    KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, StoreError, WatchEvent, WatchEventKind,
    WatchStream,
};
use crate::config::EtcdConfig;

/// 基于 etcd v3 的租约存储
pub struct EtcdStore {
    client: Mutex<Option<Client>>,
    // 关闭后用于结束仍在运行的续约流与监听流
    shutdown: CancellationToken,
}

impl EtcdStore {
    pub async fn connect(config: &EtcdConfig) -> Result<Self, StoreError> {
        let options = ConnectOptions::new()
            .with_connect_timeout(config.dial_timeout())
            .with_timeout(config.dial_timeout());

        let client = Client::connect(&config.endpoints, Some(options)).await?;

        tracing::info!(endpoints = ?config.endpoints, "Connected to etcd");

        Ok(Self {
            client: Mutex::new(Some(client)),
            shutdown: CancellationToken::new(),
        })
    }

    // etcd 客户端内部共享连接，克隆开销很小
    fn client(&self) -> Result<Client, StoreError> {
        self.client
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl LeaseStore for EtcdStore {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        let mut client = self.client()?;
        let resp = client.lease_grant(ttl_secs, None).await?;
        Ok(LeaseId(resp.id()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<(), StoreError> {
        let mut client = self.client()?;
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease.0)))
            .await?;
        Ok(())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut client = self.client()?;
        match client.lease_revoke(lease.0).await {
            Ok(_) => Ok(()),
            Err(etcd_client::Error::GRpcStatus(status))
                if status.message().contains("lease not found") =>
            {
                Err(StoreError::LeaseNotFound(lease))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let mut client = self.client()?;
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut client = self.client()?;
        client.delete(key, None).await?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        let mut client = self.client()?;
        let (watcher, events) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;

        let state = EtcdWatch {
            _watcher: watcher,
            events,
            shutdown: self.shutdown.clone(),
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            let message = tokio::select! {
                _ = state.shutdown.cancelled() => return None,
                message = state.events.message() => message,
            };
            match message {
                Ok(Some(resp)) if resp.canceled() => None,
                Ok(Some(resp)) => {
                    let batch: Vec<_> = resp
                        .events()
                        .iter()
                        .filter_map(convert_event)
                        .map(Ok)
                        .collect();
                    Some((batch, state))
                }
                Ok(None) => None,
                Err(e) => {
                    state.done = true;
                    Some((vec![Err(StoreError::from(e))], state))
                }
            }
        })
        .flat_map(futures::stream::iter);

        Ok(Box::pin(stream))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
        let mut client = self.client()?;
        let (keeper, responses) = client.lease_keep_alive(lease.0).await?;

        let state = EtcdKeepAlive {
            keeper,
            responses,
            shutdown: self.shutdown.clone(),
            next_delay: None,
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            let item = state.next_ack().await?;
            if item.is_err() {
                state.done = true;
            }
            Some((item, state))
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) {
        self.shutdown.cancel();
        if let Ok(mut guard) = self.client.lock() {
            guard.take();
        }
        tracing::info!("Etcd client closed");
    }
}

struct EtcdWatch {
    // 持有 watcher，丢弃后 etcd 端的监听会被取消
    _watcher: Watcher,
    events: etcd_client::WatchStream,
    shutdown: CancellationToken,
    done: bool,
}

struct EtcdKeepAlive {
    keeper: LeaseKeeper,
    responses: LeaseKeepAliveStream,
    shutdown: CancellationToken,
    next_delay: Option<Duration>,
    done: bool,
}

impl EtcdKeepAlive {
    // 首次立即续约，之后按 TTL 的三分之一间隔续约
    async fn next_ack(&mut self) -> Option<Result<KeepAliveAck, StoreError>> {
        if let Some(delay) = self.next_delay {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if self.shutdown.is_cancelled() {
            return None;
        }

        if let Err(e) = self.keeper.keep_alive().await {
            return Some(Err(e.into()));
        }

        match self.responses.message().await {
            Ok(Some(resp)) if resp.ttl() > 0 => {
                self.next_delay = Some(Duration::from_secs((resp.ttl() / 3).max(1) as u64));
                Some(Ok(KeepAliveAck {
                    lease_id: LeaseId(resp.id()),
                    ttl: resp.ttl(),
                }))
            }
            // TTL 为 0 表示租约已过期或已被撤销
            Ok(Some(_)) | Ok(None) => None,
            Err(e) => Some(Err(e.into())),
        }
    }
}

fn convert_event(event: &etcd_client::Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    let kind = match event.event_type() {
        EventType::Put => WatchEventKind::Put,
        EventType::Delete => WatchEventKind::Delete,
    };
    Some(WatchEvent {
        kind,
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
    })
}
