//! 测试辅助：脚本化的协作方 mock
//!
//! 每个 mock 维护一个响应队列，按调用顺序弹出；队列空时返回空结果。
//! 同时记录全部调用参数，供断言请求边界 / 方向 / 条数。

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::interval::{MessageInterval, QueryDirection};
use crate::message::{Message, MessageStatus};
use crate::network::{
    NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener,
};
use crate::remote::{CommandAck, CommandChannel, CommandOp, MessageHistoryService};

/// 构造一条服务端形态的消息（已分配 id，状态 Sent）
pub fn sent_msg(id: &str, timestamp: i64) -> Message {
    let mut m = Message::new(format!("content-{}", id));
    m.message_id = id.to_string();
    m.conversation_id = "conv".to_string();
    m.from = "peer".to_string();
    m.timestamp = timestamp;
    m.status = MessageStatus::Sent;
    m
}

/// 一次历史拉取的调用记录
#[derive(Debug, Clone)]
pub struct FetchCall {
    pub conversation_id: String,
    pub interval: MessageInterval,
    pub direction: QueryDirection,
    pub limit: usize,
}

/// 脚本化的历史消息服务
#[derive(Default)]
pub struct MockHistoryService {
    responses: Mutex<VecDeque<Result<Vec<Message>>>>,
    calls: Mutex<Vec<FetchCall>>,
}

impl MockHistoryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, messages: Vec<Message>) {
        self.responses.lock().push_back(Ok(messages));
    }

    pub fn push_err(&self, error: crate::error::RelaychatSDKError) {
        self.responses.lock().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait::async_trait]
impl MessageHistoryService for MockHistoryService {
    async fn fetch_messages(
        &self,
        _client_id: &str,
        conversation_id: &str,
        _conv_type: i32,
        interval: &MessageInterval,
        direction: QueryDirection,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.calls.lock().push(FetchCall {
            conversation_id: conversation_id.to_string(),
            interval: interval.clone(),
            direction,
            limit,
        });
        match self.responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(Vec::new()),
        }
    }
}

/// 一次指令调用的记录
#[derive(Debug, Clone)]
pub struct CommandCall {
    pub conversation_id: String,
    pub op: CommandOp,
    pub payload: serde_json::Value,
}

/// 脚本化的指令通道
#[derive(Default)]
pub struct MockCommandChannel {
    responses: Mutex<VecDeque<Result<CommandAck>>>,
    calls: Mutex<Vec<CommandCall>>,
}

impl MockCommandChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, ack: CommandAck) {
        self.responses.lock().push_back(Ok(ack));
    }

    pub fn push_err(&self, error: crate::error::RelaychatSDKError) {
        self.responses.lock().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<CommandCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait::async_trait]
impl CommandChannel for MockCommandChannel {
    async fn send_command(
        &self,
        _client_id: &str,
        conversation_id: &str,
        _conv_type: i32,
        op: CommandOp,
        payload: serde_json::Value,
    ) -> Result<CommandAck> {
        self.calls.lock().push(CommandCall {
            conversation_id: conversation_id.to_string(),
            op,
            payload,
        });
        match self.responses.lock().pop_front() {
            Some(response) => response,
            None => Ok(CommandAck::default()),
        }
    }
}

/// 固定状态的网络监听器
#[derive(Debug)]
pub struct StaticNetworkListener {
    status: Mutex<NetworkStatus>,
}

impl StaticNetworkListener {
    pub fn online() -> Self {
        Self {
            status: Mutex::new(NetworkStatus::Online),
        }
    }

    pub fn offline() -> Self {
        Self {
            status: Mutex::new(NetworkStatus::Offline),
        }
    }
}

#[async_trait::async_trait]
impl NetworkStatusListener for StaticNetworkListener {
    async fn get_current_status(&self) -> NetworkStatus {
        self.status.lock().clone()
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        let (_tx, rx) = broadcast::channel(16);
        Ok(rx)
    }

    async fn stop_monitoring(&self) {}
}

/// 预置在线 / 离线状态的网络监控器
pub async fn online_monitor(online: bool) -> Arc<NetworkMonitor> {
    let listener: Arc<dyn NetworkStatusListener> = if online {
        Arc::new(StaticNetworkListener::online())
    } else {
        Arc::new(StaticNetworkListener::offline())
    };
    let monitor = Arc::new(NetworkMonitor::new(listener));
    monitor
        .set_status(if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        })
        .await;
    monitor
}
