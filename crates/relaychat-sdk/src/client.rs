//! 客户端对象 - 协作方的注入点与会话注册表
//!
//! 所有外部协作方（历史查询服务、指令通道、存储、网络监控）在这里
//! 注入并共享给同一个用户名下的全部会话；没有任何进程级单例，
//! 生命周期随客户端对象结束。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::conversation::Conversation;
use crate::events::PushEvent;
use crate::network::NetworkMonitor;
use crate::remote::{CommandChannel, MessageHistoryService};
use crate::storage::MessageStore;
use crate::sync::SyncCoordinator;

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// 消息查询是否使用本地缓存（关闭后所有查询直连服务端）
    pub message_cache_enabled: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            message_cache_enabled: true,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_cache_enabled(mut self, enabled: bool) -> Self {
        self.message_cache_enabled = enabled;
        self
    }
}

/// 客户端对象
///
/// 同一个实例服务一个登录用户；会话按 id 惰性创建并复用。
pub struct RelaychatClient {
    client_id: String,
    options: Arc<ClientOptions>,
    store: Arc<MessageStore>,
    commands: Arc<dyn CommandChannel>,
    network: Arc<NetworkMonitor>,
    coordinator: Arc<SyncCoordinator>,
    conversations: RwLock<HashMap<String, Arc<Conversation>>>,
}

impl RelaychatClient {
    pub fn new(
        client_id: impl Into<String>,
        options: ClientOptions,
        store: Arc<MessageStore>,
        history: Arc<dyn MessageHistoryService>,
        commands: Arc<dyn CommandChannel>,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        let client_id = client_id.into();
        let coordinator = Arc::new(SyncCoordinator::new(
            client_id.clone(),
            store.clone(),
            history,
            network.clone(),
        ));
        Self {
            client_id,
            options: Arc::new(options),
            store,
            commands,
            network,
            coordinator,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// 获取（或惰性创建）会话对象
    pub fn conversation(&self, conversation_id: &str) -> Arc<Conversation> {
        if let Some(existing) = self.conversations.read().get(conversation_id) {
            return existing.clone();
        }
        let mut registry = self.conversations.write();
        registry
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                debug!("创建会话对象: conversation_id={}", conversation_id);
                Arc::new(Conversation::new(
                    conversation_id,
                    self.client_id.clone(),
                    self.options.clone(),
                    self.store.clone(),
                    self.coordinator.clone(),
                    self.commands.clone(),
                    self.network.clone(),
                ))
            })
            .clone()
    }

    /// 分发服务端推送事件到对应会话
    pub fn handle_push(&self, event: PushEvent) {
        let conversation = self.conversation(event.conversation_id());
        conversation.handle_push(event);
    }
}
