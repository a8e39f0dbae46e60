use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use super::heartbeat::HeartbeatMonitor;
use super::keepalive::KeepaliveState;
use super::service::ServiceRegistry;
use super::types::{RegisterRequest, ServiceInstance};
use crate::registry as pb;
use crate::registry::registry_service_server::RegistryService;
use crate::services::store::{WatchEvent, WatchEventKind};

// gRPC 服务实现
#[derive(Clone)]
pub struct RegistryGrpcService {
    pub registry: Arc<ServiceRegistry>,
    heartbeats: HeartbeatMonitor,
}

impl RegistryGrpcService {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        let heartbeats = HeartbeatMonitor::new(registry.config().heartbeat_timeout());
        Self {
            registry,
            heartbeats,
        }
    }
}

impl TryFrom<pb::RegisterRequest> for RegisterRequest {
    type Error = Status;

    fn try_from(req: pb::RegisterRequest) -> Result<Self, Self::Error> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument("Service name is required"));
        }
        if req.host.is_empty() {
            return Err(Status::invalid_argument("Host is required"));
        }
        let port = u16::try_from(req.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| Status::invalid_argument(format!("Invalid port: {}", req.port)))?;

        Ok(Self {
            name: req.name,
            version: req.version,
            host: req.host,
            port,
            metadata: req.metadata,
        })
    }
}

impl From<ServiceInstance> for pb::ServiceInstance {
    fn from(instance: ServiceInstance) -> Self {
        Self {
            id: instance.id,
            name: instance.name,
            version: instance.version,
            host: instance.host,
            port: u32::from(instance.port),
            metadata: instance.metadata,
            status: instance.status.as_str().to_string(),
            updated_at: instance.updated_at.to_rfc3339(),
        }
    }
}

impl From<Vec<ServiceInstance>> for pb::ServiceInstanceList {
    fn from(instances: Vec<ServiceInstance>) -> Self {
        Self {
            instances: instances.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<WatchEvent> for pb::WatchEvent {
    fn from(event: WatchEvent) -> Self {
        let event_type = match event.kind {
            WatchEventKind::Put => pb::watch_event::EventType::Put,
            WatchEventKind::Delete => pb::watch_event::EventType::Delete,
        };
        Self {
            event_type: event_type as i32,
            key: event.key,
            value: event.value,
        }
    }
}

#[tonic::async_trait]
impl RegistryService for RegistryGrpcService {
    type WatchStream = ReceiverStream<Result<pb::WatchEvent, Status>>;

    async fn register(
        &self,
        request: Request<pb::RegisterRequest>,
    ) -> Result<Response<pb::ServiceInstance>, Status> {
        let req = RegisterRequest::try_from(request.into_inner())?;

        // RPC 返回后请求上下文即结束，续约改由心跳维持
        let cancel = CancellationToken::new();
        let instance = self
            .registry
            .register_with_cancel(req, cancel.clone())
            .await?;
        self.heartbeats.track(instance.id.clone(), cancel);

        Ok(Response::new(instance.into()))
    }

    async fn deregister(
        &self,
        request: Request<pb::DeregisterRequest>,
    ) -> Result<Response<pb::DeregisterResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() || req.instance_id.is_empty() {
            return Err(Status::invalid_argument(
                "Service name and instance id are required",
            ));
        }

        self.registry.deregister(&req.name, &req.instance_id).await?;
        self.heartbeats.forget(&req.instance_id);

        Ok(Response::new(pb::DeregisterResponse {
            success: true,
            message: "Deregistration successful".into(),
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<pb::HeartbeatRequest>,
    ) -> Result<Response<pb::HeartbeatResponse>, Status> {
        let req = request.into_inner();
        if req.instance_id.is_empty() {
            return Err(Status::invalid_argument("Instance id is required"));
        }

        let renewing = matches!(
            self.registry.keepalive_state(&req.instance_id),
            Some(KeepaliveState::Running)
        );
        if !renewing || !self.heartbeats.beat(&req.instance_id) {
            self.heartbeats.forget(&req.instance_id);
            return Err(Status::not_found(format!(
                "Instance {} is not registered or has expired",
                req.instance_id
            )));
        }

        tracing::trace!(instance_id = %req.instance_id, "Heartbeat received");
        Ok(Response::new(pb::HeartbeatResponse {
            timeout_secs: self.heartbeats.timeout().as_secs(),
        }))
    }

    async fn get_service(
        &self,
        request: Request<pb::GetServiceRequest>,
    ) -> Result<Response<pb::ServiceInstanceList>, Status> {
        let req = request.into_inner();
        let instances = self.registry.get_service(&req.name).await?;
        Ok(Response::new(instances.into()))
    }

    async fn get_all_services(
        &self,
        _request: Request<pb::GetAllServicesRequest>,
    ) -> Result<Response<pb::GetAllServicesResponse>, Status> {
        let services: HashMap<String, pb::ServiceInstanceList> = self
            .registry
            .get_all_services()
            .await?
            .into_iter()
            .map(|(name, instances)| (name, instances.into()))
            .collect();

        Ok(Response::new(pb::GetAllServicesResponse { services }))
    }

    async fn watch(
        &self,
        request: Request<pb::WatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("Service name is required"));
        }

        let mut events = self.registry.watch(&req.name).await?;
        let (outbound_tx, outbound_rx) = mpsc::channel(100);
        let service_name = req.name;

        // 转发存储事件，客户端断开时结束并释放底层监听
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = outbound_tx.closed() => {
                        tracing::debug!(service_name = %service_name, "Watch client disconnected");
                        break;
                    }
                    event = events.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let message = event
                    .map(pb::WatchEvent::from)
                    .map_err(|e| Status::unavailable(e.to_string()));
                let is_err = message.is_err();
                if outbound_tx.send(message).await.is_err() {
                    tracing::debug!(service_name = %service_name, "Watch client disconnected");
                    break;
                }
                if is_err {
                    break;
                }
            }
            tracing::debug!(service_name = %service_name, "Watch stream finished");
        });

        Ok(Response::new(ReceiverStream::new(outbound_rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::RegistryConfig;
    use crate::services::store::MemoryStore;

    fn service() -> RegistryGrpcService {
        service_with(MemoryStore::new(), RegistryConfig::default())
    }

    fn service_with(store: MemoryStore, config: RegistryConfig) -> RegistryGrpcService {
        let registry = ServiceRegistry::new(Arc::new(store), config);
        RegistryGrpcService::new(Arc::new(registry))
    }

    fn short_lived() -> RegistryConfig {
        RegistryConfig {
            lease_ttl_secs: 3,
            heartbeat_timeout_secs: 3,
            ..Default::default()
        }
    }

    async fn send_heartbeat(
        svc: &RegistryGrpcService,
        instance_id: &str,
    ) -> Result<pb::HeartbeatResponse, Status> {
        svc.heartbeat(Request::new(pb::HeartbeatRequest {
            instance_id: instance_id.to_string(),
        }))
        .await
        .map(Response::into_inner)
    }

    async fn get_hello(svc: &RegistryGrpcService) -> Result<pb::ServiceInstanceList, Status> {
        svc.get_service(Request::new(pb::GetServiceRequest {
            name: "hello".to_string(),
        }))
        .await
        .map(Response::into_inner)
    }

    fn register_request(name: &str, port: u32) -> pb::RegisterRequest {
        pb::RegisterRequest {
            name: name.to_string(),
            version: "v1".to_string(),
            host: "10.0.0.1".to_string(),
            port,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_register_request_validation() {
        assert!(RegisterRequest::try_from(register_request("hello", 8080)).is_ok());

        let err = RegisterRequest::try_from(register_request("", 8080)).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let err = RegisterRequest::try_from(register_request("hello", 70000)).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let err = RegisterRequest::try_from(register_request("hello", 0)).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_register_and_get_over_grpc() {
        let svc = service();

        let registered = svc
            .register(Request::new(register_request("hello", 8080)))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(registered.status, "UP");
        assert_eq!(registered.port, 8080);

        let list = svc
            .get_service(Request::new(pb::GetServiceRequest {
                name: "hello".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(list.instances.len(), 1);
        assert_eq!(list.instances[0].id, registered.id);

        let all = svc
            .get_all_services(Request::new(pb::GetAllServicesRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(all.services["hello"].instances.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_service_maps_to_not_found() {
        let status = service()
            .get_service(Request::new(pb::GetServiceRequest {
                name: "ghost".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_watch_forwards_events() {
        let svc = service();
        let mut stream = svc
            .watch(Request::new(pb::WatchRequest {
                name: "hello".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();

        let registered = svc
            .register(Request::new(register_request("hello", 8080)))
            .await
            .unwrap()
            .into_inner();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.event_type, pb::watch_event::EventType::Put as i32);
        assert_eq!(event.key, format!("/services/hello/{}", registered.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_expires_after_ttl() {
        let svc = service_with(MemoryStore::new(), short_lived());

        let silent = svc
            .register(Request::new(register_request("hello", 8080)))
            .await
            .unwrap()
            .into_inner();
        let beating = svc
            .register(Request::new(register_request("hello", 8081)))
            .await
            .unwrap()
            .into_inner();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let ack = send_heartbeat(&svc, &beating.id).await.unwrap();
            assert_eq!(ack.timeout_secs, 3);
        }

        // 未发心跳的实例停止续约并在 TTL 后过期
        let list = get_hello(&svc).await.unwrap();
        assert_eq!(list.instances.len(), 1);
        assert_eq!(list.instances[0].id, beating.id);

        let status = send_heartbeat(&svc, &silent.id).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let status = get_hello(&svc).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_eq!(svc.registry.tracked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_stops_heartbeat_tracking() {
        let svc = service_with(MemoryStore::new(), short_lived());
        let registered = svc
            .register(Request::new(register_request("hello", 8080)))
            .await
            .unwrap()
            .into_inner();
        assert!(send_heartbeat(&svc, &registered.id).await.is_ok());

        svc.deregister(Request::new(pb::DeregisterRequest {
            name: "hello".to_string(),
            instance_id: registered.id.clone(),
        }))
        .await
        .unwrap();

        assert!(svc.heartbeats.is_empty());
        let status = send_heartbeat(&svc, &registered.id).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_watch_released_when_client_disconnects() {
        let store = MemoryStore::new();
        let svc = service_with(store.clone(), RegistryConfig::default());

        let stream = svc
            .watch(Request::new(pb::WatchRequest {
                name: "hello".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(store.watcher_count(), 1);

        // 没有任何事件时也应释放存储侧监听
        drop(stream);
        tokio::time::timeout(Duration::from_secs(1), async {
            while store.watcher_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("Store watch was not released");
    }
}
