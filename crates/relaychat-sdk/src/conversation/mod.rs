//! 会话状态与外发消息管线
//!
//! 功能包括：
//! - 属性树读写：修改先挂起为字段操作，服务端确认后才提交
//! - 最新消息指针（单调，不回退）与未读计数
//! - 对端回执时间（已读 / 已送达）
//! - 历史消息查询（委托同步协调器）
//! - 消息发送 / 修改 / 撤回的乐观状态机

pub mod attrs;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::ClientOptions;
use crate::error::{RelaychatSDKError, Result};
use crate::events::PushEvent;
use crate::interval::{MessageInterval, QueryDirection};
use crate::message::{Message, MessageStatus};
use crate::network::NetworkMonitor;
use crate::remote::{CommandChannel, CommandOp};
use crate::storage::MessageStore;
use crate::sync::{CachePolicy, QueryTarget, SyncCoordinator};

use attrs::{AttrValue, FieldOperation};

/// 服务端约定的属性键
pub mod keys {
    pub const OBJECT_ID: &str = "objectId";
    pub const NAME: &str = "name";
    pub const ATTRIBUTE: &str = "attr";
    pub const MEMBERS: &str = "m";
    pub const CREATOR: &str = "c";
    pub const TRANSIENT: &str = "tr";
    pub const SYSTEM: &str = "sys";
    pub const TEMPORARY: &str = "temp";
    pub const TEMPORARY_TTL: &str = "ttl";
    pub const UNIQUE_ID: &str = "uniqueId";
    pub const CREATED_AT: &str = "createdAt";
    pub const LAST_MESSAGE: &str = "lastMessage";
    pub const LAST_MESSAGE_AT: &str = "lastMessageAt";
}

const ATTR_PREFIX: &str = "attr.";

/// 属性 fetch 出错后的冷却窗口，窗口内不再发起拉取
const FETCH_COOLDOWN_MS: i64 = 3600 * 1000;

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationType {
    /// 普通会话
    Normal,
    /// 暂态聊天室（不落本地缓存）
    Transient,
    /// 服务号
    System,
    /// 临时会话
    Temporary,
}

impl ConversationType {
    /// 协议层类型编码
    pub fn code(&self) -> i32 {
        match self {
            ConversationType::Normal => 1,
            ConversationType::Transient => 2,
            ConversationType::System => 3,
            ConversationType::Temporary => 4,
        }
    }
}

/// 发送选项
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// 暂态消息：服务端只转发不存储，本地同样不落缓存
    pub transient: bool,
    /// @ 提及的成员
    pub mentioned_members: Vec<String>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    pub fn with_mentioned_members(mut self, members: Vec<String>) -> Self {
        self.mentioned_members = members;
        self
    }
}

/// 会话可变状态，整体放在一把会话级读写锁后面
struct ConversationInner {
    /// 已提交的属性树（始终是 Map）
    instance_data: AttrValue,
    /// 挂起的字段操作，按点路径唯一
    pending_operations: HashMap<String, FieldOperation>,
    last_message: Option<Message>,
    last_message_at: i64,
    unread_count: i32,
    unread_mentioned: bool,
    last_read_at: i64,
    last_delivered_at: i64,
    /// 最近一次属性 fetch 的时间（毫秒）
    latest_fetch_timestamp: i64,
    /// 是否已从缓存同步过最新消息，避免重复查库
    synced_last_message: bool,
}

/// 会话对象
///
/// 所有协作方由 client 注入；可安全地跨任务共享（Arc）。
pub struct Conversation {
    conversation_id: String,
    client_id: String,
    options: Arc<ClientOptions>,
    store: Arc<MessageStore>,
    coordinator: Arc<SyncCoordinator>,
    commands: Arc<dyn CommandChannel>,
    network: Arc<NetworkMonitor>,
    inner: RwLock<ConversationInner>,
    /// 当前这一代查询的取消令牌
    query_cancel: Mutex<CancellationToken>,
}

impl Conversation {
    pub(crate) fn new(
        conversation_id: impl Into<String>,
        client_id: impl Into<String>,
        options: Arc<ClientOptions>,
        store: Arc<MessageStore>,
        coordinator: Arc<SyncCoordinator>,
        commands: Arc<dyn CommandChannel>,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let mut root = AttrValue::empty_map();
        root.set_path(keys::OBJECT_ID, AttrValue::String(conversation_id.clone()));
        Self {
            conversation_id,
            client_id: client_id.into(),
            options,
            store,
            coordinator,
            commands,
            network,
            inner: RwLock::new(ConversationInner {
                instance_data: root,
                pending_operations: HashMap::new(),
                last_message: None,
                last_message_at: 0,
                unread_count: 0,
                unread_mentioned: false,
                last_read_at: 0,
                last_delivered_at: 0,
                latest_fetch_timestamp: 0,
                synced_last_message: false,
            }),
            query_cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    // ---- 属性读写 ----

    /// 读取属性：先按点路径取已提交值，再叠加同路径的挂起操作，
    /// 所以未确认的本地修改对读取方立即可见
    pub fn get(&self, key: &str) -> Option<AttrValue> {
        if key.is_empty() {
            return None;
        }
        let inner = self.inner.read();
        let committed = inner.instance_data.get_path(key).cloned();
        match inner.pending_operations.get(key) {
            Some(op) => op.apply(committed.as_ref()),
            None => committed,
        }
    }

    /// 写入属性：只进挂起队列，不碰已提交的属性树
    pub fn set(&self, key: &str, value: AttrValue) {
        if key.is_empty() || value == AttrValue::Null {
            return;
        }
        self.add_new_operation(key, FieldOperation::Set(value));
    }

    /// 删除属性：同样以挂起操作表示
    pub fn remove(&self, key: &str) {
        if key.is_empty() {
            return;
        }
        self.add_new_operation(key, FieldOperation::Delete);
    }

    fn add_new_operation(&self, key: &str, op: FieldOperation) {
        let mut inner = self.inner.write();
        let previous = inner.pending_operations.remove(key);
        inner.pending_operations.insert(key.to_string(), op.merge(previous));
    }

    /// 自定义属性读取（自动补 "attr." 前缀，name 除外）
    pub fn attribute(&self, key: &str) -> Option<AttrValue> {
        if key.is_empty() {
            return None;
        }
        if key == keys::NAME {
            self.get(key)
        } else if key.starts_with(ATTR_PREFIX) {
            self.get(key)
        } else {
            self.get(&format!("{}{}", ATTR_PREFIX, key))
        }
    }

    /// 自定义属性写入（自动补 "attr." 前缀，name 除外）
    pub fn set_attribute(&self, key: &str, value: AttrValue) {
        if key.is_empty() {
            return;
        }
        if key == keys::NAME || key.starts_with(ATTR_PREFIX) {
            self.set(key, value);
        } else {
            self.set(&format!("{}{}", ATTR_PREFIX, key), value);
        }
    }

    pub fn name(&self) -> Option<String> {
        self.get(keys::NAME)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.set(keys::NAME, AttrValue::String(name.into()));
    }

    pub fn creator(&self) -> Option<String> {
        self.get(keys::CREATOR)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn unique_id(&self) -> Option<String> {
        self.get(keys::UNIQUE_ID)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn members(&self) -> Vec<String> {
        self.get(keys::MEMBERS)
            .and_then(|v| {
                v.as_list().map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    pub fn is_transient(&self) -> bool {
        self.get(keys::TRANSIENT)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn is_system(&self) -> bool {
        self.get(keys::SYSTEM)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn is_temporary(&self) -> bool {
        self.get(keys::TEMPORARY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn conv_type(&self) -> ConversationType {
        if self.is_system() {
            ConversationType::System
        } else if self.is_transient() {
            ConversationType::Transient
        } else if self.is_temporary() {
            ConversationType::Temporary
        } else {
            ConversationType::Normal
        }
    }

    /// 临时会话的过期时间（秒）
    pub fn temporary_expired_at(&self) -> i64 {
        self.get(keys::TEMPORARY_TTL)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    /// 该会话是否允许本地消息缓存
    pub fn cache_enabled(&self) -> bool {
        self.options.message_cache_enabled && !self.is_transient()
    }

    // ---- 属性提交 ----

    /// 把挂起的字段操作提交到服务端
    ///
    /// 只有确认成功后才把操作应用进属性树并清除对应键；失败时一切
    /// 保持挂起，等下一次提交，不存在部分提交。
    pub async fn update_info(&self) -> Result<()> {
        let snapshot: Vec<(String, FieldOperation)> = {
            let inner = self.inner.read();
            inner
                .pending_operations
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        if snapshot.is_empty() {
            return Ok(());
        }

        let mut payload = Map::new();
        for (key, op) in &snapshot {
            payload.insert(key.clone(), op.encode());
        }
        let conv_type = self.conv_type().code();
        self.commands
            .send_command(
                &self.client_id,
                &self.conversation_id,
                conv_type,
                CommandOp::UpdateConversation,
                Value::Object(payload),
            )
            .await?;

        let snapshot_json = {
            let mut inner = self.inner.write();
            for (key, op) in &snapshot {
                let committed = inner.instance_data.get_path(key).cloned();
                match op.apply(committed.as_ref()) {
                    Some(value) => {
                        inner.instance_data.set_path(key, value);
                    }
                    None => {
                        inner.instance_data.delete_path(key);
                    }
                }
                // 提交期间被改写的操作保留，等下一次提交
                if inner.pending_operations.get(key) == Some(op) {
                    inner.pending_operations.remove(key);
                }
            }
            inner.instance_data.to_json().to_string()
        };

        if let Err(e) = self
            .store
            .insert_conversation(&self.conversation_id, &snapshot_json)
        {
            warn!(
                "会话属性快照落库失败: conversation_id={}, error={}",
                self.conversation_id, e
            );
        }
        Ok(())
    }

    /// 挂起操作数量（观测用）
    pub fn pending_operation_count(&self) -> usize {
        self.inner.read().pending_operations.len()
    }

    // ---- 最新消息 ----

    /// 最新一条消息；首次读取时从缓存懒同步
    pub fn last_message(&self) -> Option<Message> {
        let need_sync = {
            let inner = self.inner.read();
            self.options.message_cache_enabled && !inner.synced_last_message
        };
        if need_sync {
            let from_store = match self.store.get_latest_message(&self.conversation_id) {
                Ok(found) => found,
                Err(e) => {
                    warn!("读取缓存最新消息失败: error={}", e);
                    None
                }
            };
            let mut inner = self.inner.write();
            inner.synced_last_message = true;
            if let Some(message) = from_store {
                Self::merge_last_message(&mut inner, message);
            }
        }
        self.inner.read().last_message.clone()
    }

    /// 更新最新消息指针：幂等且单调，时间戳更小的候选是 no-op
    pub fn set_last_message(&self, candidate: Message) {
        let mut inner = self.inner.write();
        Self::merge_last_message(&mut inner, candidate);
    }

    fn merge_last_message(inner: &mut ConversationInner, candidate: Message) {
        let replace = match &inner.last_message {
            None => true,
            Some(current) => current.timestamp <= candidate.timestamp,
        };
        if replace {
            inner.last_message_at = inner.last_message_at.max(candidate.timestamp);
            inner.last_message = Some(candidate);
        }
    }

    pub fn last_message_at(&self) -> i64 {
        self.inner.read().last_message_at
    }

    // ---- 未读计数 ----

    pub fn unread_count(&self) -> i32 {
        self.inner.read().unread_count
    }

    pub fn unread_mentioned(&self) -> bool {
        self.inner.read().unread_mentioned
    }

    /// 推送驱动的增量更新
    pub fn increase_unread(&self, delta: i32, mentioned: bool) {
        let (count, flag) = {
            let mut inner = self.inner.write();
            inner.unread_count += delta;
            if mentioned {
                inner.unread_mentioned = true;
            }
            (inner.unread_count, inner.unread_mentioned)
        };
        if let Err(e) = self
            .store
            .update_conversation_unread(&self.conversation_id, count, flag)
        {
            warn!("未读计数落库失败: error={}", e);
        }
    }

    /// resync 下发的权威绝对值，连同最新消息一起更新
    pub fn update_unread(&self, count: i32, mentioned: bool, last_message: Option<Message>) {
        if let Some(message) = last_message {
            if self.cache_enabled() {
                if let Err(e) = self.store.insert_message(&message, true) {
                    warn!("最新消息落库失败: error={}", e);
                }
            }
            self.set_last_message(message);
        }
        let changed = {
            let mut inner = self.inner.write();
            if inner.unread_count != count {
                inner.unread_count = count;
                inner.unread_mentioned = mentioned;
                true
            } else {
                false
            }
        };
        if changed {
            if let Err(e) = self
                .store
                .update_conversation_unread(&self.conversation_id, count, mentioned)
            {
                warn!("未读计数落库失败: error={}", e);
            }
        }
    }

    // ---- 回执时间 ----

    pub fn last_read_at(&self) -> i64 {
        self.inner.read().last_read_at
    }

    /// 对端最后送达时间；已读必然已送达，所以取两者较大值
    pub fn last_delivered_at(&self) -> i64 {
        let inner = self.inner.read();
        inner.last_read_at.max(inner.last_delivered_at)
    }

    pub fn set_last_read_at(&self, timestamp: i64, save_to_local: bool) {
        let updated = {
            let mut inner = self.inner.write();
            if timestamp > inner.last_read_at {
                inner.last_read_at = timestamp;
                true
            } else {
                false
            }
        };
        if updated && save_to_local {
            self.persist_times();
        }
    }

    pub fn set_last_delivered_at(&self, timestamp: i64, save_to_local: bool) {
        let updated = {
            let mut inner = self.inner.write();
            if timestamp > inner.last_delivered_at {
                inner.last_delivered_at = timestamp;
                true
            } else {
                false
            }
        };
        if updated && save_to_local {
            self.persist_times();
        }
    }

    fn persist_times(&self) {
        let (read_at, delivered_at) = {
            let inner = self.inner.read();
            (inner.last_read_at, inner.last_delivered_at)
        };
        if let Err(e) =
            self.store
                .update_conversation_times(&self.conversation_id, read_at, delivered_at)
        {
            warn!("回执时间落库失败: error={}", e);
        }
    }

    /// 从服务端拉取对端回执时间并单调合并
    pub async fn fetch_receipt_timestamps(&self) -> Result<()> {
        let ack = self
            .commands
            .send_command(
                &self.client_id,
                &self.conversation_id,
                self.conv_type().code(),
                CommandOp::FetchReceipts,
                json!({}),
            )
            .await?;

        let data = ack.data.unwrap_or(Value::Null);
        let read_at = data.get("read_at").and_then(Value::as_i64).unwrap_or(0);
        let delivered_at = data
            .get("delivered_at")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        debug!(
            "回执时间: conversation_id={}, read_at={}, delivered_at={}",
            self.conversation_id, read_at, delivered_at
        );
        self.set_last_read_at(read_at, false);
        self.set_last_delivered_at(delivered_at, false);
        self.persist_times();
        Ok(())
    }

    // ---- 属性同步 ----

    /// 属性是否已经过期需要重新拉取
    ///
    /// 属性 fetch 出错会进入冷却窗口，避免权限类错误造成每收一条
    /// 消息就拉一次
    pub fn is_should_fetch(&self) -> bool {
        let created_missing = self.get(keys::CREATED_AT).is_none();
        let last_fetch = self.inner.read().latest_fetch_timestamp;
        created_missing || Utc::now().timestamp_millis() - last_fetch > FETCH_COOLDOWN_MS
    }

    pub fn set_must_fetch(&self) {
        self.inner.write().latest_fetch_timestamp = 0;
    }

    pub fn update_fetch_timestamp(&self, timestamp: i64) {
        self.inner.write().latest_fetch_timestamp = timestamp;
    }

    /// 从服务端刷新会话属性
    pub async fn fetch_info(&self) -> Result<()> {
        let result = self
            .commands
            .send_command(
                &self.client_id,
                &self.conversation_id,
                self.conv_type().code(),
                CommandOp::FetchConversation,
                json!({ "where": { "objectId": self.conversation_id } }),
            )
            .await;

        match result {
            Ok(ack) => {
                match ack.data {
                    Some(payload) => self.absorb_server_payload(&payload),
                    None => {
                        return Err(RelaychatSDKError::Service {
                            code: 9100,
                            message: "Conversation not found".into(),
                        })
                    }
                }
                self.update_fetch_timestamp(Utc::now().timestamp_millis());
                let snapshot = self.inner.read().instance_data.to_json().to_string();
                if let Err(e) = self
                    .store
                    .insert_conversation(&self.conversation_id, &snapshot)
                {
                    warn!("会话属性快照落库失败: error={}", e);
                }
                Ok(())
            }
            Err(e) => {
                if e.is_service_error() {
                    // 业务错误同样进入冷却窗口
                    self.update_fetch_timestamp(Utc::now().timestamp_millis());
                }
                Err(e)
            }
        }
    }

    /// 吸收服务端下发的会话负载：整树替换属性，最新消息按单调规则合并
    pub fn absorb_server_payload(&self, payload: &Value) {
        let parsed = AttrValue::from_json(payload);
        let last_message = payload
            .get(keys::LAST_MESSAGE)
            .and_then(|v| serde_json::from_value::<Message>(v.clone()).ok());
        let last_message_at = payload
            .get(keys::LAST_MESSAGE_AT)
            .and_then(Value::as_i64);

        {
            let mut inner = self.inner.write();
            if parsed.as_map().is_some() {
                inner.instance_data = parsed;
            }
            if let Some(message) = last_message {
                Self::merge_last_message(&mut inner, message);
            }
            if let Some(at) = last_message_at {
                inner.last_message_at = inner.last_message_at.max(at);
            }
        }
    }

    /// 合并新成员（去重）
    pub fn merge_members(&self, new_members: &[String]) {
        if new_members.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        let mut merged: Vec<String> = inner
            .instance_data
            .get_path(keys::MEMBERS)
            .and_then(|v| v.as_list().map(|l| l.to_vec()))
            .unwrap_or_default()
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect();
        let mut seen: HashSet<String> = merged.iter().cloned().collect();
        for member in new_members {
            if seen.insert(member.clone()) {
                merged.push(member.clone());
            }
        }
        let list = AttrValue::List(merged.into_iter().map(AttrValue::String).collect());
        inner.instance_data.set_path(keys::MEMBERS, list);
    }

    /// 移除成员
    pub fn remove_members(&self, gone_members: &[String]) {
        if gone_members.is_empty() {
            return;
        }
        let gone: HashSet<&String> = gone_members.iter().collect();
        let mut inner = self.inner.write();
        let remaining: Vec<AttrValue> = inner
            .instance_data
            .get_path(keys::MEMBERS)
            .and_then(|v| v.as_list().map(|l| l.to_vec()))
            .unwrap_or_default()
            .into_iter()
            .filter(|item| match item.as_str() {
                Some(id) => !gone.contains(&id.to_string()),
                None => true,
            })
            .collect();
        inner
            .instance_data
            .set_path(keys::MEMBERS, AttrValue::List(remaining));
    }

    // ---- 历史查询 ----

    fn query_target(&self) -> QueryTarget {
        QueryTarget {
            conversation_id: self.conversation_id.clone(),
            conv_type: self.conv_type().code(),
            cache_enabled: self.cache_enabled(),
        }
    }

    fn cancel_token(&self) -> CancellationToken {
        self.query_cancel.lock().clone()
    }

    /// 取消当前这一代进行中的查询；之后的查询不受影响
    pub fn cancel_queries(&self) {
        let mut token = self.query_cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// 查询最新 limit 条消息
    pub async fn query_messages(&self, limit: usize) -> Result<Vec<Message>> {
        self.query_messages_with_policy(limit, CachePolicy::NetworkWithCacheHint)
            .await
    }

    /// 按指定缓存策略查询最新一页
    pub async fn query_messages_with_policy(
        &self,
        limit: usize,
        policy: CachePolicy,
    ) -> Result<Vec<Message>> {
        let cancel = self.cancel_token();
        let result = self
            .coordinator
            .query_latest(&self.query_target(), limit, policy, &cancel)
            .await?;
        if let Some(newest) = result.last() {
            self.set_last_message(newest.clone());
        }
        Ok(result)
    }

    /// 向上翻页：查询给定位置之前的历史
    pub async fn query_messages_before(
        &self,
        message_id: &str,
        timestamp: i64,
        limit: usize,
    ) -> Result<Vec<Message>> {
        if message_id.is_empty() && timestamp == 0 {
            return self.query_messages(limit).await;
        }
        let cancel = self.cancel_token();
        let result = self
            .coordinator
            .query_before(
                &self.query_target(),
                message_id,
                timestamp,
                limit,
                CachePolicy::CacheThenMerge,
                &cancel,
            )
            .await?;
        if let Some(newest) = result.last() {
            // 单调合并，翻旧页时是 no-op
            self.set_last_message(newest.clone());
        }
        Ok(result)
    }

    /// 强制走服务端查询最新一页
    pub async fn query_messages_from_server(&self, limit: usize) -> Result<Vec<Message>> {
        self.query_messages_with_policy(limit, CachePolicy::NetworkOnly)
            .await
    }

    /// 只读本地缓存
    pub async fn query_messages_from_cache(&self, limit: usize) -> Result<Vec<Message>> {
        self.query_messages_with_policy(limit, CachePolicy::CacheOnly)
            .await
    }

    /// 按区间查询历史，总是直连服务端
    pub async fn query_messages_in_interval(
        &self,
        interval: &MessageInterval,
        direction: QueryDirection,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let cancel = self.cancel_token();
        self.coordinator
            .query_interval(&self.query_target(), interval, direction, limit, &cancel)
            .await
    }

    // ---- 外发管线 ----

    /// 发送消息
    ///
    /// 离线时立即失败（状态 Failed），不发起网络请求、不写缓存。
    /// ack 后采用服务端分配的 message_id 与权威时间戳。
    pub async fn send_message(&self, message: &mut Message, options: &SendOptions) -> Result<()> {
        message.conversation_id = self.conversation_id.clone();
        message.from = self.client_id.clone();
        message.generate_unique_token();
        message.stamp_client_timestamp();
        message.status = MessageStatus::Sending;

        if !self.network.is_online().await {
            message.status = MessageStatus::Failed;
            return Err(RelaychatSDKError::NotConnected);
        }

        let payload = json!({
            "content": message.content,
            "token": message.unique_token,
            "timestamp": message.timestamp,
            "transient": options.transient,
            "mentioned_members": options.mentioned_members,
        });

        match self
            .commands
            .send_command(
                &self.client_id,
                &self.conversation_id,
                self.conv_type().code(),
                CommandOp::SendMessage,
                payload,
            )
            .await
        {
            Ok(ack) => {
                if let Some(message_id) = ack.message_id {
                    message.message_id = message_id;
                }
                if let Some(timestamp) = ack.timestamp {
                    message.timestamp = timestamp;
                }
                message.status = MessageStatus::Sent;

                if !options.transient && self.cache_enabled() {
                    if let Err(e) = self.store.insert_message(message, false) {
                        warn!("发送成功但缓存写入失败: error={}", e);
                    }
                    self.set_last_message(message.clone());
                } else {
                    debug!("跳过本地缓存写入: conversation_id={}", self.conversation_id);
                }

                {
                    let mut inner = self.inner.write();
                    inner.last_message_at = inner.last_message_at.max(message.timestamp);
                }
                if let Err(e) = self
                    .store
                    .update_conversation_last_message_at(&self.conversation_id, message.timestamp)
                {
                    warn!("最新消息时间落库失败: error={}", e);
                }
                Ok(())
            }
            Err(e) => {
                message.status = MessageStatus::Failed;
                Err(e)
            }
        }
    }

    /// 修改已发送消息的内容
    ///
    /// 信封字段从原消息复制，内容由新消息提供，补丁时间取服务端返回值。
    pub async fn update_message(
        &self,
        old_message: &Message,
        new_message: &mut Message,
    ) -> Result<()> {
        if !old_message.has_server_id() {
            return Err(RelaychatSDKError::InvalidArgument(
                "target message has no server id".into(),
            ));
        }
        if !self.network.is_online().await {
            return Err(RelaychatSDKError::NotConnected);
        }

        let payload = json!({
            "message_id": old_message.message_id,
            "timestamp": old_message.timestamp,
            "content": new_message.content,
        });
        let ack = self
            .commands
            .send_command(
                &self.client_id,
                &self.conversation_id,
                self.conv_type().code(),
                CommandOp::UpdateMessage,
                payload,
            )
            .await?;

        new_message.copy_envelope_from(old_message);
        new_message.update_at = ack.patch_time.unwrap_or(0);
        if let Err(e) = self.store.update_message_for_patch(new_message) {
            warn!("消息补丁落库失败: error={}", e);
        }
        Ok(())
    }

    /// 撤回已发送的消息，返回撤回后的占位记录
    pub async fn recall_message(&self, message: &Message) -> Result<Message> {
        if !message.has_server_id() {
            return Err(RelaychatSDKError::InvalidArgument(
                "target message has no server id".into(),
            ));
        }
        if !message.status.can_transition_to(MessageStatus::Recalled) {
            return Err(RelaychatSDKError::InvalidOperation(format!(
                "message in status {:?} cannot be recalled",
                message.status
            )));
        }
        if !self.network.is_online().await {
            return Err(RelaychatSDKError::NotConnected);
        }

        let payload = json!({
            "message_id": message.message_id,
            "timestamp": message.timestamp,
        });
        let ack = self
            .commands
            .send_command(
                &self.client_id,
                &self.conversation_id,
                self.conv_type().code(),
                CommandOp::RecallMessage,
                payload,
            )
            .await?;

        let mut recalled = Message::new("");
        recalled.copy_envelope_from(message);
        recalled.update_at = ack.patch_time.unwrap_or(0);
        recalled.status = MessageStatus::Recalled;
        if let Err(e) = self.store.update_message_for_patch(&recalled) {
            warn!("撤回补丁落库失败: error={}", e);
        }
        Ok(recalled)
    }

    /// 上报已读位置并乐观清零本地未读数
    ///
    /// 之后 resync 下发的权威绝对值仍会覆盖本地值。
    pub async fn mark_read(&self) -> Result<()> {
        if self.is_transient() {
            return Ok(());
        }
        if !self.network.is_online().await {
            return Err(RelaychatSDKError::NotConnected);
        }

        let mut payload = Map::new();
        if let Some(last) = self.last_message() {
            payload.insert("message_id".into(), Value::String(last.message_id));
            payload.insert("timestamp".into(), Value::Number(last.timestamp.into()));
        }
        self.commands
            .send_command(
                &self.client_id,
                &self.conversation_id,
                self.conv_type().code(),
                CommandOp::MarkRead,
                Value::Object(payload),
            )
            .await?;

        {
            let mut inner = self.inner.write();
            inner.unread_count = 0;
            inner.unread_mentioned = false;
        }
        if let Err(e) = self
            .store
            .update_conversation_unread(&self.conversation_id, 0, false)
        {
            warn!("未读清零落库失败: error={}", e);
        }
        Ok(())
    }

    /// 暂存发送失败的草稿
    pub fn add_to_local_cache(&self, message: &Message) -> Result<()> {
        self.store.insert_local_message(message)
    }

    /// 移除暂存的草稿
    pub fn remove_from_local_cache(&self, message: &Message) -> Result<()> {
        self.store.remove_local_message(message)
    }

    // ---- 推送吸收 ----

    /// 吸收服务端推送事件，使用与同步拉取相同的单调规则
    pub fn handle_push(&self, event: PushEvent) {
        match event {
            PushEvent::MessageReceived {
                message, mentioned, ..
            } => {
                if self.cache_enabled() {
                    if let Err(e) = self.store.insert_message(&message, true) {
                        warn!("推送消息落库失败: error={}", e);
                    }
                }
                self.set_last_message(message);
                self.increase_unread(1, mentioned);
            }
            PushEvent::UnreadCountChanged {
                count,
                mentioned,
                last_message,
                ..
            } => {
                self.update_unread(count, mentioned, last_message);
            }
            PushEvent::ReceiptUpdated {
                read_at,
                delivered_at,
                ..
            } => {
                self.set_last_read_at(read_at, false);
                self.set_last_delivered_at(delivered_at, false);
                self.persist_times();
            }
            PushEvent::MessagePatched {
                mut message,
                patch_time,
                ..
            } => {
                message.update_at = patch_time;
                if let Err(e) = self.store.update_message_for_patch(&message) {
                    warn!("推送补丁落库失败: error={}", e);
                }
            }
            PushEvent::MembersJoined { members, .. } => {
                self.merge_members(&members);
            }
            PushEvent::MembersLeft { members, .. } => {
                self.remove_members(&members);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkMonitor;
    use crate::test_support::{
        online_monitor, sent_msg, MockCommandChannel, MockHistoryService,
    };
    use crate::remote::CommandAck;

    struct Fixture {
        conversation: Conversation,
        commands: Arc<MockCommandChannel>,
        store: Arc<MessageStore>,
        network: Arc<NetworkMonitor>,
    }

    async fn fixture(online: bool) -> Fixture {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        let history = Arc::new(MockHistoryService::new());
        let commands = Arc::new(MockCommandChannel::new());
        let network = online_monitor(online).await;
        let coordinator = Arc::new(SyncCoordinator::new(
            "me",
            store.clone(),
            history,
            network.clone(),
        ));
        let conversation = Conversation::new(
            "conv",
            "me",
            Arc::new(ClientOptions::default()),
            store.clone(),
            coordinator,
            commands.clone(),
            network.clone(),
        );
        Fixture {
            conversation,
            commands,
            store,
            network,
        }
    }

    #[tokio::test]
    async fn test_pending_operation_visible_before_flush() {
        let f = fixture(true).await;
        f.conversation
            .set("topic", AttrValue::String("Party".into()));

        assert_eq!(
            f.conversation.get("topic").unwrap().as_str(),
            Some("Party")
        );

        // 提交失败：读取不变，操作保持挂起
        f.commands
            .push_err(RelaychatSDKError::Network("connection reset".into()));
        let err = f.conversation.update_info().await.unwrap_err();
        assert!(matches!(err, RelaychatSDKError::Network(_)));
        assert_eq!(
            f.conversation.get("topic").unwrap().as_str(),
            Some("Party")
        );
        assert_eq!(f.conversation.pending_operation_count(), 1);
    }

    #[tokio::test]
    async fn test_update_info_commits_and_clears() {
        let f = fixture(true).await;
        f.conversation.set_name("group");
        f.conversation
            .set("topic", AttrValue::String("Party".into()));

        f.conversation.update_info().await.unwrap();

        assert_eq!(f.conversation.pending_operation_count(), 0);
        assert_eq!(f.conversation.name().as_deref(), Some("group"));
        assert_eq!(
            f.conversation.get("topic").unwrap().as_str(),
            Some("Party")
        );

        // 负载里带着编码后的操作
        let calls = f.commands.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].op, CommandOp::UpdateConversation);
        assert_eq!(
            calls[0].payload.get("name").and_then(Value::as_str),
            Some("group")
        );

        // 快照已落库
        let row = f.store.get_conversation_row("conv").unwrap().unwrap();
        assert!(row.instance_data.contains("Party"));
    }

    #[tokio::test]
    async fn test_remove_commits_as_delete() {
        let f = fixture(true).await;
        f.conversation.set_name("group");
        f.conversation.update_info().await.unwrap();

        f.conversation.remove(keys::NAME);
        assert!(f.conversation.name().is_none());
        f.conversation.update_info().await.unwrap();

        assert!(f.conversation.name().is_none());
        assert_eq!(f.conversation.pending_operation_count(), 0);
    }

    #[tokio::test]
    async fn test_attribute_prefix_mapping() {
        let f = fixture(true).await;
        f.conversation
            .set_attribute("theme", AttrValue::String("dark".into()));
        assert_eq!(
            f.conversation.get("attr.theme").unwrap().as_str(),
            Some("dark")
        );
        assert_eq!(
            f.conversation.attribute("theme").unwrap().as_str(),
            Some("dark")
        );

        f.conversation.set_attribute(keys::NAME, AttrValue::String("g".into()));
        assert_eq!(f.conversation.name().as_deref(), Some("g"));
    }

    #[tokio::test]
    async fn test_last_message_is_monotonic() {
        let f = fixture(true).await;
        f.conversation.set_last_message(sent_msg("m1", 100));
        f.conversation.set_last_message(sent_msg("m3", 300));
        f.conversation.set_last_message(sent_msg("m2", 200));

        let last = f.conversation.last_message().unwrap();
        assert_eq!(last.message_id, "m3");
        assert_eq!(f.conversation.last_message_at(), 300);
    }

    #[tokio::test]
    async fn test_last_message_lazy_sync_from_store() {
        let f = fixture(true).await;
        f.store.insert_message(&sent_msg("m9", 900), false).unwrap();

        let last = f.conversation.last_message().unwrap();
        assert_eq!(last.message_id, "m9");
    }

    #[tokio::test]
    async fn test_send_offline_fails_without_side_effects() {
        let f = fixture(false).await;
        let mut message = Message::new("hello");

        let err = f
            .conversation
            .send_message(&mut message, &SendOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RelaychatSDKError::NotConnected));
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(f.commands.call_count(), 0);
        assert_eq!(f.store.get_message_count("conv").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_adopts_ack_and_writes_through() {
        let f = fixture(true).await;
        f.commands.push_ok(CommandAck {
            message_id: Some("srv-1".into()),
            timestamp: Some(999),
            ..Default::default()
        });

        let mut message = Message::new("hello");
        f.conversation
            .send_message(&mut message, &SendOptions::new())
            .await
            .unwrap();

        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.message_id, "srv-1");
        assert_eq!(message.timestamp, 999);
        assert!(!message.unique_token.is_empty());

        // 写穿缓存 + 最新消息指针 + 会话时间
        let (cached, breakpoint) = f.store.get_message("srv-1", 999, "conv").unwrap().unwrap();
        assert_eq!(cached.content, "hello");
        assert!(!breakpoint);
        assert_eq!(f.conversation.last_message().unwrap().message_id, "srv-1");
        let row = f.store.get_conversation_row("conv").unwrap().unwrap();
        assert_eq!(row.last_message_at, 999);
    }

    #[tokio::test]
    async fn test_send_transient_skips_cache() {
        let f = fixture(true).await;
        f.commands.push_ok(CommandAck {
            message_id: Some("srv-2".into()),
            timestamp: Some(1000),
            ..Default::default()
        });

        let mut message = Message::new("hi");
        let options = SendOptions::new().with_transient(true);
        f.conversation.send_message(&mut message, &options).await.unwrap();

        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(f.store.get_message_count("conv").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_marks_failed() {
        let f = fixture(true).await;
        f.commands
            .push_err(RelaychatSDKError::Timeout("deadline".into()));

        let mut message = Message::new("hello");
        let err = f
            .conversation
            .send_message(&mut message, &SendOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RelaychatSDKError::Timeout(_)));
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(f.store.get_message_count("conv").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_message_copies_envelope() {
        let f = fixture(true).await;
        let mut original = sent_msg("m1", 100);
        original.delivered_at = 150;
        f.store.insert_message(&original, false).unwrap();

        f.commands.push_ok(CommandAck {
            patch_time: Some(555),
            ..Default::default()
        });
        let mut edited = Message::new("edited");
        f.conversation
            .update_message(&original, &mut edited)
            .await
            .unwrap();

        assert_eq!(edited.message_id, "m1");
        assert_eq!(edited.timestamp, 100);
        assert_eq!(edited.delivered_at, 150);
        assert_eq!(edited.update_at, 555);
        let (cached, _) = f.store.get_message("m1", 100, "conv").unwrap().unwrap();
        assert_eq!(cached.content, "edited");
        assert_eq!(cached.update_at, 555);
    }

    #[tokio::test]
    async fn test_update_message_requires_server_id() {
        let f = fixture(true).await;
        let unsent = Message::new("draft");
        let mut edited = Message::new("edited");

        let err = f
            .conversation
            .update_message(&unsent, &mut edited)
            .await
            .unwrap_err();
        assert!(matches!(err, RelaychatSDKError::InvalidArgument(_)));
        assert_eq!(f.commands.call_count(), 0);
    }

    #[tokio::test]
    async fn test_recall_produces_recalled_record() {
        let f = fixture(true).await;
        let original = sent_msg("m1", 100);
        f.store.insert_message(&original, false).unwrap();

        f.commands.push_ok(CommandAck {
            patch_time: Some(777),
            ..Default::default()
        });
        let recalled = f.conversation.recall_message(&original).await.unwrap();

        assert_eq!(recalled.status, MessageStatus::Recalled);
        assert_eq!(recalled.message_id, "m1");
        assert_eq!(recalled.update_at, 777);
        assert!(recalled.content.is_empty());
        let (cached, _) = f.store.get_message("m1", 100, "conv").unwrap().unwrap();
        assert_eq!(cached.status, MessageStatus::Recalled);
    }

    #[tokio::test]
    async fn test_mark_read_optimistically_resets_unread() {
        let f = fixture(true).await;
        f.conversation.increase_unread(5, true);
        assert_eq!(f.conversation.unread_count(), 5);

        f.conversation.mark_read().await.unwrap();
        assert_eq!(f.conversation.unread_count(), 0);
        assert!(!f.conversation.unread_mentioned());

        let row = f.store.get_conversation_row("conv").unwrap().unwrap();
        assert_eq!(row.unread_count, 0);
    }

    #[tokio::test]
    async fn test_mark_read_failure_keeps_unread() {
        let f = fixture(true).await;
        f.conversation.increase_unread(3, false);
        f.commands
            .push_err(RelaychatSDKError::Network("reset".into()));

        let err = f.conversation.mark_read().await.unwrap_err();
        assert!(matches!(err, RelaychatSDKError::Network(_)));
        assert_eq!(f.conversation.unread_count(), 3);
    }

    #[tokio::test]
    async fn test_unread_absolute_overrides_delta() {
        let f = fixture(true).await;
        f.conversation.increase_unread(2, false);
        f.conversation.increase_unread(1, true);
        assert_eq!(f.conversation.unread_count(), 3);
        assert!(f.conversation.unread_mentioned());

        // resync 的权威绝对值
        f.conversation.update_unread(7, false, Some(sent_msg("m7", 700)));
        assert_eq!(f.conversation.unread_count(), 7);
        assert!(!f.conversation.unread_mentioned());
        assert_eq!(f.conversation.last_message().unwrap().message_id, "m7");
    }

    #[tokio::test]
    async fn test_receipt_times_are_monotonic() {
        let f = fixture(true).await;
        f.conversation.set_last_read_at(100, false);
        f.conversation.set_last_read_at(50, false);
        f.conversation.set_last_delivered_at(80, false);

        assert_eq!(f.conversation.last_read_at(), 100);
        // 已读必然已送达
        assert_eq!(f.conversation.last_delivered_at(), 100);

        f.conversation.set_last_delivered_at(300, false);
        assert_eq!(f.conversation.last_delivered_at(), 300);
    }

    #[tokio::test]
    async fn test_fetch_receipt_timestamps() {
        let f = fixture(true).await;
        f.commands.push_ok(CommandAck {
            data: Some(json!({ "read_at": 123, "delivered_at": 456 })),
            ..Default::default()
        });

        f.conversation.fetch_receipt_timestamps().await.unwrap();
        assert_eq!(f.conversation.last_read_at(), 123);
        assert_eq!(f.conversation.last_delivered_at(), 456);

        let row = f.store.get_conversation_row("conv").unwrap().unwrap();
        assert_eq!(row.last_read_at, 123);
        assert_eq!(row.last_delivered_at, 456);
    }

    #[tokio::test]
    async fn test_member_merge_and_remove() {
        let f = fixture(true).await;
        f.conversation.absorb_server_payload(&json!({
            "objectId": "conv",
            "m": ["alice", "bob"],
        }));

        f.conversation
            .merge_members(&["bob".to_string(), "carol".to_string()]);
        let mut members = f.conversation.members();
        members.sort();
        assert_eq!(members, vec!["alice", "bob", "carol"]);

        f.conversation.remove_members(&["alice".to_string()]);
        let mut members = f.conversation.members();
        members.sort();
        assert_eq!(members, vec!["bob", "carol"]);
    }

    #[tokio::test]
    async fn test_transient_conversation_disables_cache() {
        let f = fixture(true).await;
        f.conversation.absorb_server_payload(&json!({
            "objectId": "conv",
            "tr": true,
        }));

        assert!(f.conversation.is_transient());
        assert_eq!(f.conversation.conv_type(), ConversationType::Transient);
        assert!(!f.conversation.cache_enabled());

        // 暂态会话的 mark_read 是 no-op
        f.conversation.mark_read().await.unwrap();
        assert_eq!(f.commands.call_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_push_message_received() {
        let f = fixture(true).await;
        let incoming = sent_msg("p1", 500);
        f.conversation.handle_push(PushEvent::MessageReceived {
            conversation_id: "conv".into(),
            message: incoming,
            mentioned: true,
        });

        assert_eq!(f.conversation.unread_count(), 1);
        assert!(f.conversation.unread_mentioned());
        assert_eq!(f.conversation.last_message().unwrap().message_id, "p1");
        // 推送来源的记录连续性未知，落库带断点
        let (_, breakpoint) = f.store.get_message("p1", 500, "conv").unwrap().unwrap();
        assert!(breakpoint);
    }

    #[tokio::test]
    async fn test_handle_push_patch_and_receipts() {
        let f = fixture(true).await;
        f.store.insert_message(&sent_msg("m1", 100), false).unwrap();

        let mut patched = sent_msg("m1", 100);
        patched.content = "edited".into();
        f.conversation.handle_push(PushEvent::MessagePatched {
            conversation_id: "conv".into(),
            message: patched,
            patch_time: 888,
        });
        let (cached, _) = f.store.get_message("m1", 100, "conv").unwrap().unwrap();
        assert_eq!(cached.content, "edited");
        assert_eq!(cached.update_at, 888);

        f.conversation.handle_push(PushEvent::ReceiptUpdated {
            conversation_id: "conv".into(),
            read_at: 150,
            delivered_at: 200,
        });
        assert_eq!(f.conversation.last_read_at(), 150);
        assert_eq!(f.conversation.last_delivered_at(), 200);
    }

    #[tokio::test]
    async fn test_is_should_fetch_cooldown() {
        let f = fixture(true).await;
        // 没有 createdAt：需要拉取
        assert!(f.conversation.is_should_fetch());

        f.conversation.absorb_server_payload(&json!({
            "objectId": "conv",
            "createdAt": "2026-01-01T00:00:00Z",
        }));
        f.conversation
            .update_fetch_timestamp(Utc::now().timestamp_millis());
        assert!(!f.conversation.is_should_fetch());

        f.conversation.set_must_fetch();
        assert!(f.conversation.is_should_fetch());
    }

    #[tokio::test]
    async fn test_local_draft_parking() {
        let f = fixture(false).await;
        let mut message = Message::new("draft");
        let _ = f
            .conversation
            .send_message(&mut message, &SendOptions::new())
            .await;
        assert_eq!(message.status, MessageStatus::Failed);

        f.conversation.add_to_local_cache(&message).unwrap();
        f.conversation.remove_from_local_cache(&message).unwrap();
        let _ = f.network;
    }
}
