//! 推送事件
//!
//! 指令通道是双向的：服务端会主动推送新消息、未读数重置、回执时间、
//! 成员变动和消息补丁。client 层解包后路由到对应会话，会话按与同步
//! 拉取完全相同的单调规则吸收这些事件。

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// 服务端推送事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PushEvent {
    /// 收到新消息（未读数加一，mentioned 时置提及标记）
    MessageReceived {
        conversation_id: String,
        message: Message,
        mentioned: bool,
    },
    /// 未读数重置（resync 下发的权威绝对值）
    UnreadCountChanged {
        conversation_id: String,
        count: i32,
        mentioned: bool,
        last_message: Option<Message>,
    },
    /// 对端回执时间更新
    ReceiptUpdated {
        conversation_id: String,
        read_at: i64,
        delivered_at: i64,
    },
    /// 已发送消息被修改 / 撤回
    MessagePatched {
        conversation_id: String,
        message: Message,
        patch_time: i64,
    },
    /// 成员加入
    MembersJoined {
        conversation_id: String,
        members: Vec<String>,
    },
    /// 成员退出
    MembersLeft {
        conversation_id: String,
        members: Vec<String>,
    },
}

impl PushEvent {
    /// 事件所属的会话
    pub fn conversation_id(&self) -> &str {
        match self {
            PushEvent::MessageReceived { conversation_id, .. }
            | PushEvent::UnreadCountChanged { conversation_id, .. }
            | PushEvent::ReceiptUpdated { conversation_id, .. }
            | PushEvent::MessagePatched { conversation_id, .. }
            | PushEvent::MembersJoined { conversation_id, .. }
            | PushEvent::MembersLeft { conversation_id, .. } => conversation_id,
        }
    }
}
