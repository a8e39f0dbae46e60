use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::error::RegistryError;
use super::keepalive::{KeepaliveHandle, KeepaliveState, spawn_keepalive};
use super::keys;
use super::lease_tracker::{LeaseTracker, TrackedLease};
use super::types::{RegisterRequest, ServiceInstance};
use crate::config::{Config, RegistryConfig};
use crate::services::store::{
    EtcdStore, KeyValue, LeaseId, LeaseStore, StoreError, WatchStream,
};

/// 基于租约存储的服务注册中心
///
/// 每次注册申请一个租约并把实例写到 `/services/{name}/{id}`，随后由后台任务持续续约。
/// 发现类操作直接按前缀读取存储。
pub struct ServiceRegistry {
    store: Arc<dyn LeaseStore>,
    leases: Arc<LeaseTracker>,
    config: RegistryConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn LeaseStore>, config: RegistryConfig) -> Self {
        Self {
            store,
            leases: Arc::new(LeaseTracker::new()),
            config,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// 连接 etcd 并创建注册中心
    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let store = EtcdStore::connect(&config.etcd).await?;
        Ok(Self::new(Arc::new(store), config.registry.clone()))
    }

    /// 注册实例，续约任务随注册中心关闭或注销而停止
    pub async fn register(&self, req: RegisterRequest) -> Result<ServiceInstance, RegistryError> {
        self.register_with_cancel(req, CancellationToken::new()).await
    }

    /// 注册实例，`cancel` 被取消后续约停止，实例在 TTL 后过期
    pub async fn register_with_cancel(
        &self,
        req: RegisterRequest,
        cancel: CancellationToken,
    ) -> Result<ServiceInstance, RegistryError> {
        let instance = ServiceInstance::from_request(req);

        let lease_id = self
            .timed(self.store.grant(self.config.lease_ttl_secs))
            .await
            .map_err(RegistryError::lease("register: grant lease"))?;

        let data = instance
            .to_json()
            .map_err(|source| RegistryError::EncodingFailure {
                operation: "register: encode instance",
                source,
            })?;

        // 写入失败时不撤销租约，由存储在 TTL 后回收
        let key = keys::instance_key(&instance.name, &instance.id);
        self.timed(self.store.put(&key, data, lease_id))
            .await
            .map_err(RegistryError::store("register: put instance"))?;

        let registry_cancel = self.shutdown.child_token();
        let keepalive = spawn_keepalive(
            &self.tasks,
            self.store.clone(),
            instance.id.clone(),
            lease_id,
            registry_cancel.clone(),
            cancel,
        );
        self.leases.insert(
            instance.id.clone(),
            TrackedLease {
                lease_id,
                service_name: instance.name.clone(),
                keepalive: keepalive.clone(),
            },
        );
        self.prune_when_stopped(instance.id.clone(), lease_id, keepalive, registry_cancel);

        tracing::info!(
            service_name = %instance.name,
            instance_id = %instance.id,
            address = %instance.address(),
            lease_id = %lease_id,
            "Registered service instance"
        );

        Ok(instance)
    }

    /// 注销实例：先撤销本地记录的租约，再删除键
    pub async fn deregister(
        &self,
        service_name: &str,
        instance_id: &str,
    ) -> Result<(), RegistryError> {
        if let Some(lease_id) = self.leases.lease_id(instance_id) {
            match self.timed(self.store.revoke(lease_id)).await {
                Ok(()) => {}
                Err(StoreError::LeaseNotFound(_)) => {
                    tracing::warn!(
                        service_name = %service_name,
                        instance_id = %instance_id,
                        lease_id = %lease_id,
                        "Lease already gone at store, dropping local record"
                    );
                }
                Err(source) => {
                    return Err(RegistryError::LeaseFailure {
                        operation: "deregister: revoke lease",
                        source,
                    });
                }
            }
            if let Some(tracked) = self.leases.remove(instance_id) {
                tracked.keepalive.stop();
            }
        }

        let key = keys::instance_key(service_name, instance_id);
        self.timed(self.store.delete(&key))
            .await
            .map_err(RegistryError::store("deregister: delete key"))?;

        tracing::info!(
            service_name = %service_name,
            instance_id = %instance_id,
            "Deregistered service instance"
        );
        Ok(())
    }

    /// 获取服务的所有存活实例，没有实例时返回 [`RegistryError::NotFound`]
    pub async fn get_service(
        &self,
        service_name: &str,
    ) -> Result<Vec<ServiceInstance>, RegistryError> {
        let prefix = keys::service_prefix(service_name);
        let kvs = self
            .timed(self.store.get_prefix(&prefix))
            .await
            .map_err(RegistryError::store("get service"))?;

        let instances: Vec<_> = kvs.into_iter().filter_map(decode_record).collect();
        if instances.is_empty() {
            return Err(RegistryError::NotFound {
                service_name: service_name.to_string(),
            });
        }

        tracing::debug!(
            service_name = %service_name,
            instance_count = instances.len(),
            "Resolved service instances"
        );
        Ok(instances)
    }

    /// 获取所有服务，按服务名分组
    pub async fn get_all_services(
        &self,
    ) -> Result<HashMap<String, Vec<ServiceInstance>>, RegistryError> {
        let kvs = self
            .timed(self.store.get_prefix(keys::SERVICE_KEY_PREFIX))
            .await
            .map_err(RegistryError::store("get all services"))?;

        let mut services: HashMap<String, Vec<ServiceInstance>> = HashMap::new();
        for instance in kvs.into_iter().filter_map(decode_record) {
            services
                .entry(instance.name.clone())
                .or_default()
                .push(instance);
        }
        Ok(services)
    }

    /// 监听服务实例的变更，事件为存储原始的 put/delete
    pub async fn watch(&self, service_name: &str) -> Result<WatchStream, RegistryError> {
        let prefix = keys::service_prefix(service_name);
        let stream = self
            .timed(self.store.watch_prefix(&prefix))
            .await
            .map_err(RegistryError::store("watch"))?;

        tracing::debug!(service_name = %service_name, "Opened watch stream");
        Ok(stream)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn lease_id(&self, instance_id: &str) -> Option<LeaseId> {
        self.leases.lease_id(instance_id)
    }

    pub fn keepalive_state(&self, instance_id: &str) -> Option<KeepaliveState> {
        self.leases.keepalive_state(instance_id)
    }

    pub fn keepalive(&self, instance_id: &str) -> Option<KeepaliveHandle> {
        self.leases.get(instance_id).map(|tracked| tracked.keepalive)
    }

    /// 本进程持有租约的实例数量
    pub fn tracked_count(&self) -> usize {
        self.leases.len()
    }

    /// 停止所有续约任务并释放存储连接
    ///
    /// 未注销的实例会在 TTL 到期后由存储删除。
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.tasks.close();
        self.store.close().await;
        self.tasks.wait().await;

        tracing::info!(
            tracked_instances = self.leases.len(),
            "Service registry closed"
        );
    }

    // 续约流关闭或调用方取消后，本地记录随之移除；注销和关闭自行处理记录
    fn prune_when_stopped(
        &self,
        instance_id: String,
        lease_id: LeaseId,
        keepalive: KeepaliveHandle,
        registry_cancel: CancellationToken,
    ) {
        let leases = self.leases.clone();
        self.tasks.spawn(async move {
            let state = keepalive.stopped().await;
            if registry_cancel.is_cancelled() {
                return;
            }
            if leases.remove_if_lease(&instance_id, lease_id).is_some() {
                tracing::debug!(
                    instance_id = %instance_id,
                    lease_id = %lease_id,
                    state = ?state,
                    "Dropped local record of stopped keepalive"
                );
            }
        });
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.config.request_timeout(), fut)
            .await
            .map_err(|_| StoreError::Timeout)?
    }
}

// 单条记录解码失败时跳过，避免一条损坏的数据掩盖其他健康实例
fn decode_record(kv: KeyValue) -> Option<ServiceInstance> {
    match ServiceInstance::from_json(&kv.value) {
        Ok(instance) => Some(instance),
        Err(source) => {
            let skipped = RegistryError::PartialDecodeSkip {
                key: kv.key,
                source,
            };
            tracing::warn!(error = %skipped, "Skipping malformed service record");
            None
        }
    }
}
