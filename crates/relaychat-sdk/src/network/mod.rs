//! 网络状态监控
//!
//! 同步协调器与发送管线在每次走网络之前都会询问这里：
//! 离线时读路径直接回退缓存，写路径立即标记失败。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;

/// 网络状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限
    Limited,
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: u64,
}

/// 网络状态监听器 trait（由平台层实现，如 Android/iOS）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<tokio::sync::RwLock<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            listener,
            status_sender,
            current_status: Arc::new(tokio::sync::RwLock::new(NetworkStatus::Offline)),
        }
    }

    /// 启动网络监控
    pub async fn start(&self) -> Result<()> {
        {
            let initial = self.listener.get_current_status().await;
            let mut status = self.current_status.write().await;
            *status = initial;
        }

        let mut receiver = self.listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        // 监听任务：同步平台层上报的状态变化
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                {
                    let mut status = current_status.write().await;
                    *status = event.new_status.clone();
                }
                let _ = status_sender.send(event);
            }
        });

        Ok(())
    }

    /// 获取当前网络状态
    pub async fn get_status(&self) -> NetworkStatus {
        self.current_status.read().await.clone()
    }

    /// 手动设置网络状态（用于连接建立 / 断开时更新）
    pub async fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.current_status.write().await;
            let old = status.clone();
            *status = new_status.clone();
            old
        };

        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
        };
        let _ = self.status_sender.send(event);
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    /// 当前是否可以发起网络请求
    pub async fn is_online(&self) -> bool {
        let status = self.get_status().await;
        matches!(status, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StaticNetworkListener;

    #[tokio::test]
    async fn test_manual_status_switch() {
        let monitor = NetworkMonitor::new(Arc::new(StaticNetworkListener::online()));
        assert!(!monitor.is_online().await);

        monitor.set_status(NetworkStatus::Online).await;
        assert!(monitor.is_online().await);

        monitor.set_status(NetworkStatus::Offline).await;
        assert!(!monitor.is_online().await);
    }

    #[tokio::test]
    async fn test_start_pulls_listener_status() {
        let monitor = NetworkMonitor::new(Arc::new(StaticNetworkListener::online()));
        monitor.start().await.unwrap();
        assert!(monitor.is_online().await);
    }
}
