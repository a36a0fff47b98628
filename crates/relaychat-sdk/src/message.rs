//! 消息实体与发送状态机
//!
//! 排序法则：先比较 timestamp（升序），相同时按 message_id 的字典序。
//! 「连续」「最新」的判断都以此为唯一依据。

use std::cmp::Ordering;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 消息发送状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// 发送中
    Sending,
    /// 已送达服务端
    Sent,
    /// 发送失败
    Failed,
    /// 已撤回
    Recalled,
}

impl MessageStatus {
    /// 检查是否可以从当前状态转换到目标状态
    pub fn can_transition_to(&self, target: MessageStatus) -> bool {
        match (self, target) {
            (MessageStatus::Sending, MessageStatus::Sent) => true,
            (MessageStatus::Sending, MessageStatus::Failed) => true,
            (MessageStatus::Sent, MessageStatus::Recalled) => true,
            _ => false,
        }
    }

    pub fn is_sent_successfully(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Recalled)
    }

    pub fn is_send_failed(&self) -> bool {
        matches!(self, MessageStatus::Failed)
    }
}

/// 消息实体
///
/// `message_id` 由服务端分配，收到 ack 之前为空字符串；
/// `message_id` 非空时状态必然是 Sent 或 Recalled。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// 服务端分配的消息 ID，ack 之前为空
    pub message_id: String,
    /// 所属会话 ID
    pub conversation_id: String,
    /// 发送方 ID
    pub from: String,
    /// 发送时间（毫秒，服务端对同一会话保证单调）
    pub timestamp: i64,
    /// 修改时间（毫秒），从未被修改时为 0
    pub update_at: i64,
    /// 消息负载，引擎不解析
    pub content: String,
    /// 发送状态
    pub status: MessageStatus,
    /// 对方收到消息的时间（毫秒）
    pub delivered_at: i64,
    /// 对方读到消息的时间（毫秒）
    pub read_at: i64,
    /// 客户端生成的幂等 token，发往服务端用于去重
    #[serde(default)]
    pub unique_token: String,
    /// 是否提及了当前用户（由推送侧标记）
    #[serde(default)]
    pub mentioned: bool,
}

impl Message {
    /// 创建一条待发送的新消息
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            message_id: String::new(),
            conversation_id: String::new(),
            from: String::new(),
            timestamp: 0,
            update_at: 0,
            content: content.into(),
            status: MessageStatus::Sending,
            delivered_at: 0,
            read_at: 0,
            unique_token: String::new(),
            mentioned: false,
        }
    }

    /// 生成幂等 token（已有则保留）
    pub fn generate_unique_token(&mut self) {
        if self.unique_token.is_empty() {
            self.unique_token = Uuid::new_v4().to_string();
        }
    }

    /// 用当前时间戳标记发送时间
    pub fn stamp_client_timestamp(&mut self) {
        self.timestamp = Utc::now().timestamp_millis();
    }

    /// 是否已取得服务端 ID
    pub fn has_server_id(&self) -> bool {
        !self.message_id.is_empty()
    }

    /// 排序法则：timestamp 升序，相同时按 message_id 字典序
    pub fn cmp_order(&self, other: &Message) -> Ordering {
        match self.timestamp.cmp(&other.timestamp) {
            Ordering::Equal => self.message_id.cmp(&other.message_id),
            ord => ord,
        }
    }

    /// 修改 / 撤回时从原消息复制不可变的信封字段，内容由新消息提供
    pub fn copy_envelope_from(&mut self, original: &Message) {
        self.message_id = original.message_id.clone();
        self.conversation_id = original.conversation_id.clone();
        self.from = original.from.clone();
        self.timestamp = original.timestamp;
        self.delivered_at = original.delivered_at;
        self.read_at = original.read_at;
        self.status = original.status;
    }
}

/// 按排序法则升序排列并按 message_id 去重
///
/// 合并缓存段与网络段时使用；重复的 message_id 保留后出现的那条
/// （网络返回的记录覆盖本地旧值）。
pub fn sort_dedup_ascending(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by(|a, b| a.cmp_order(b));
    let mut deduped: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match deduped
            .iter()
            .position(|m| !m.message_id.is_empty() && m.message_id == message.message_id)
        {
            Some(idx) => deduped[idx] = message,
            None => deduped.push(message),
        }
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transition_validation() {
        // 有效转换
        assert!(MessageStatus::Sending.can_transition_to(MessageStatus::Sent));
        assert!(MessageStatus::Sending.can_transition_to(MessageStatus::Failed));
        assert!(MessageStatus::Sent.can_transition_to(MessageStatus::Recalled));

        // 无效转换
        assert!(!MessageStatus::Sent.can_transition_to(MessageStatus::Sending));
        assert!(!MessageStatus::Failed.can_transition_to(MessageStatus::Sent));
        assert!(!MessageStatus::Recalled.can_transition_to(MessageStatus::Sent));
    }

    #[test]
    fn test_order_law() {
        let mut a = Message::new("1");
        a.message_id = "a".into();
        a.timestamp = 100;
        let mut b = Message::new("2");
        b.message_id = "b".into();
        b.timestamp = 100;
        let mut c = Message::new("3");
        c.message_id = "c".into();
        c.timestamp = 50;

        assert_eq!(a.cmp_order(&b), Ordering::Less);
        assert_eq!(b.cmp_order(&a), Ordering::Greater);
        assert_eq!(a.cmp_order(&c), Ordering::Greater);

        let sorted = sort_dedup_ascending(vec![b.clone(), a.clone(), c.clone()]);
        let ids: Vec<&str> = sorted.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_sort_dedup_keeps_latest_duplicate() {
        let mut first = Message::new("old");
        first.message_id = "m1".into();
        first.timestamp = 100;
        let mut second = Message::new("new");
        second.message_id = "m1".into();
        second.timestamp = 100;

        let merged = sort_dedup_ascending(vec![first, second]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].content, "new");
    }

    #[test]
    fn test_copy_envelope() {
        let mut original = Message::new("hello");
        original.message_id = "m1".into();
        original.conversation_id = "conv".into();
        original.from = "alice".into();
        original.timestamp = 123;
        original.delivered_at = 456;
        original.read_at = 789;
        original.status = MessageStatus::Sent;

        let mut patched = Message::new("edited");
        patched.copy_envelope_from(&original);

        assert_eq!(patched.message_id, "m1");
        assert_eq!(patched.conversation_id, "conv");
        assert_eq!(patched.from, "alice");
        assert_eq!(patched.timestamp, 123);
        assert_eq!(patched.delivered_at, 456);
        assert_eq!(patched.read_at, 789);
        assert_eq!(patched.status, MessageStatus::Sent);
        assert_eq!(patched.content, "edited");
    }
}
