use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Liveness {
    beat: watch::Sender<Instant>,
    cancel: CancellationToken,
}

/// 远端注册实例的心跳监视
///
/// 每个实例一个看门狗任务，超过 `timeout` 没有心跳即取消该实例的续约令牌，
/// 租约随后在 TTL 内过期。
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    entries: Arc<DashMap<String, Liveness>>,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 开始监视实例，心跳超时后取消 `cancel`
    pub fn track(&self, instance_id: String, cancel: CancellationToken) {
        let (beat, mut beats) = watch::channel(Instant::now());
        self.entries.insert(
            instance_id.clone(),
            Liveness {
                beat,
                cancel: cancel.clone(),
            },
        );

        let entries = self.entries.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = beats.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(timeout) => {
                        tracing::warn!(
                            instance_id = %instance_id,
                            timeout_secs = timeout.as_secs(),
                            "Heartbeat timed out, stopping lease renewal"
                        );
                        cancel.cancel();
                        break;
                    }
                }
            }
            entries.remove(&instance_id);
        });
    }

    /// 记录一次心跳，实例未被监视或已超时返回 false
    pub fn beat(&self, instance_id: &str) -> bool {
        match self.entries.get(instance_id) {
            Some(liveness) if !liveness.cancel.is_cancelled() => {
                liveness.beat.send_replace(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// 停止监视并取消续约令牌
    pub fn forget(&self, instance_id: &str) {
        if let Some((_, liveness)) = self.entries.remove(instance_id) {
            liveness.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_silence_cancels_token() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(3));
        let cancel = CancellationToken::new();
        monitor.track("i-1".to_string(), cancel.clone());

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert!(monitor.beat("i-1"));
        }
        assert!(!cancel.is_cancelled());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(cancel.is_cancelled());
        assert!(!monitor.beat("i-1"));
        assert!(monitor.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_cancels_and_removes() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(3));
        let cancel = CancellationToken::new();
        monitor.track("i-1".to_string(), cancel.clone());
        assert_eq!(monitor.len(), 1);

        monitor.forget("i-1");
        assert!(cancel.is_cancelled());
        assert!(!monitor.beat("i-1"));
        assert!(monitor.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_instance_rejects_beat() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(3));
        assert!(!monitor.beat("nobody"));
    }
}
