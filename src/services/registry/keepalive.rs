use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::services::store::{LeaseId, LeaseStore};

/// 续约任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveState {
    Running,
    Stopped(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// 调用方取消、注销或注册中心关闭
    Cancelled,
    /// 存储关闭了续约流，租约将在 TTL 后过期
    StreamClosed,
    /// 续约流未能打开
    OpenFailed,
}

/// 续约任务句柄，任务停止后不会自动重启
#[derive(Debug, Clone)]
pub struct KeepaliveHandle {
    cancel: CancellationToken,
    state: watch::Receiver<KeepaliveState>,
}

impl KeepaliveHandle {
    pub fn state(&self) -> KeepaliveState {
        *self.state.borrow()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// 等待任务进入终止状态
    pub async fn stopped(&self) -> KeepaliveState {
        let mut state = self.state.clone();
        let result = state
            .wait_for(|s| matches!(s, KeepaliveState::Stopped(_)))
            .await
            .map(|s| *s);
        result.unwrap_or_else(|_| *state.borrow())
    }
}

/// 为一个租约启动续约任务
///
/// `cancel` 由注册中心派生（注销或关闭时触发），`caller` 为注册调用方提供的取消令牌。
pub(crate) fn spawn_keepalive(
    tasks: &TaskTracker,
    store: Arc<dyn LeaseStore>,
    instance_id: String,
    lease_id: LeaseId,
    cancel: CancellationToken,
    caller: CancellationToken,
) -> KeepaliveHandle {
    let (state_tx, state_rx) = watch::channel(KeepaliveState::Running);
    let handle = KeepaliveHandle {
        cancel: cancel.clone(),
        state: state_rx,
    };

    tasks.spawn(async move {
        let reason = run(store.as_ref(), &instance_id, lease_id, &cancel, &caller).await;
        tracing::debug!(
            instance_id = %instance_id,
            lease_id = %lease_id,
            reason = ?reason,
            "Keepalive task stopped"
        );
        state_tx.send_replace(KeepaliveState::Stopped(reason));
    });

    handle
}

async fn run(
    store: &dyn LeaseStore,
    instance_id: &str,
    lease_id: LeaseId,
    cancel: &CancellationToken,
    caller: &CancellationToken,
) -> StopReason {
    let mut acks = tokio::select! {
        biased;
        _ = cancel.cancelled() => return StopReason::Cancelled,
        _ = caller.cancelled() => return StopReason::Cancelled,
        opened = store.keep_alive(lease_id) => match opened {
            Ok(acks) => acks,
            Err(e) => {
                tracing::warn!(
                    instance_id = %instance_id,
                    lease_id = %lease_id,
                    error = %e,
                    "Failed to open keepalive stream, lease will expire after TTL"
                );
                return StopReason::OpenFailed;
            }
        },
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return StopReason::Cancelled,
            _ = caller.cancelled() => return StopReason::Cancelled,
            ack = acks.next() => match ack {
                Some(Ok(ack)) => {
                    tracing::trace!(instance_id = %instance_id, lease_id = %lease_id, ttl = ack.ttl, "Lease renewed");
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        instance_id = %instance_id,
                        lease_id = %lease_id,
                        error = %e,
                        "Keepalive stream failed, lease will expire after TTL"
                    );
                    return StopReason::StreamClosed;
                }
                None => {
                    tracing::warn!(
                        instance_id = %instance_id,
                        lease_id = %lease_id,
                        "Keepalive stream closed, lease will expire after TTL"
                    );
                    return StopReason::StreamClosed;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::MemoryStore;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_cancel() {
        let store = MemoryStore::new();
        let lease = store.grant(3).await.unwrap();
        let tasks = TaskTracker::new();

        let handle = spawn_keepalive(
            &tasks,
            Arc::new(store.clone()),
            "i-1".to_string(),
            lease,
            CancellationToken::new(),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.state(), KeepaliveState::Running);
        assert_eq!(store.lease_count(), 1);

        handle.stop();
        assert_eq!(
            handle.stopped().await,
            KeepaliveState::Stopped(StopReason::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_token_stops_task() {
        let store = MemoryStore::new();
        let lease = store.grant(3).await.unwrap();
        let caller = CancellationToken::new();

        let handle = spawn_keepalive(
            &TaskTracker::new(),
            Arc::new(store),
            "i-1".to_string(),
            lease,
            CancellationToken::new(),
            caller.clone(),
        );
        caller.cancel();
        assert_eq!(
            handle.stopped().await,
            KeepaliveState::Stopped(StopReason::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_closure_is_terminal() {
        let store = MemoryStore::new();
        let lease = store.grant(3).await.unwrap();

        let handle = spawn_keepalive(
            &TaskTracker::new(),
            Arc::new(store.clone()),
            "i-1".to_string(),
            lease,
            CancellationToken::new(),
            CancellationToken::new(),
        );
        store.sever_keep_alive(lease);

        assert_eq!(
            handle.stopped().await,
            KeepaliveState::Stopped(StopReason::StreamClosed)
        );
    }

    #[tokio::test]
    async fn test_unknown_lease_fails_to_open() {
        let handle = spawn_keepalive(
            &TaskTracker::new(),
            Arc::new(MemoryStore::new()),
            "i-1".to_string(),
            LeaseId(7),
            CancellationToken::new(),
            CancellationToken::new(),
        );
        assert_eq!(
            handle.stopped().await,
            KeepaliveState::Stopped(StopReason::OpenFailed)
        );
    }
}
