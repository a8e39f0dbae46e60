use std::sync::Arc;

use crate::config::Config;
use crate::registry::registry_service_server::RegistryServiceServer;
use crate::services::registry::{RegistryGrpcService, ServiceRegistry};
use tonic::transport::Server;

pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config.server.listen_addr.parse()?;

    // 连接 etcd 并初始化服务注册中心
    let registry = Arc::new(ServiceRegistry::connect(&config).await?);

    let registry_service = RegistryGrpcService::new(registry.clone());

    tracing::info!(
        addr = %addr,
        lease_ttl_secs = config.registry.lease_ttl_secs,
        "Service registry listening"
    );

    let served = Server::builder()
        .add_service(RegistryServiceServer::new(registry_service))
        .serve_with_shutdown(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await;

    // 停止续约并释放 etcd 连接，未注销的实例在 TTL 后过期
    registry.close().await;
    served?;

    Ok(())
}
