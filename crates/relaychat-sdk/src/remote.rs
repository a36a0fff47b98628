//! 远端协作方契约
//!
//! 引擎不实现传输与编码，只依赖两个窄接口：
//! - [`MessageHistoryService`]：带边界、带方向的分页历史拉取
//! - [`CommandChannel`]：通用指令/确认通道（发送、修改、撤回、会话属性更新等）
//!
//! 推送事件（新消息、未读数变化、成员变动）从通道的另一个方向进来，
//! 由 client 层解包成 [`crate::events::PushEvent`] 后分发给会话吸收。

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::interval::{MessageInterval, QueryDirection};
use crate::message::Message;

/// 历史消息查询服务（由传输层实现）
///
/// 近端边界收窄查询范围；远端边界是发给服务端的截断提示，
/// 服务端一旦返回到远端位置就停止，客户端因此不必重复下载已缓存的数据。
#[async_trait]
pub trait MessageHistoryService: Send + Sync {
    /// 拉取一页历史消息
    ///
    /// NewToOld 方向时返回列表最新在前。失败时报
    /// Timeout / Network / Service 三类错误之一。
    async fn fetch_messages(
        &self,
        client_id: &str,
        conversation_id: &str,
        conv_type: i32,
        interval: &MessageInterval,
        direction: QueryDirection,
        limit: usize,
    ) -> Result<Vec<Message>>;
}

/// 指令类型，与服务端的会话 / 消息操作一一对应
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOp {
    /// 发送消息
    SendMessage,
    /// 修改已发送消息的内容
    UpdateMessage,
    /// 撤回消息
    RecallMessage,
    /// 提交会话属性变更
    UpdateConversation,
    /// 上报已读位置
    MarkRead,
    /// 拉取对端回执时间
    FetchReceipts,
    /// 拉取会话属性
    FetchConversation,
}

/// 指令确认结果
#[derive(Debug, Clone, Default)]
pub struct CommandAck {
    /// 服务端分配的消息 ID（SendMessage）
    pub message_id: Option<String>,
    /// 服务端权威时间戳（SendMessage）
    pub timestamp: Option<i64>,
    /// 补丁时间（UpdateMessage / RecallMessage）
    pub patch_time: Option<i64>,
    /// 其余返回体（FetchReceipts / FetchConversation）
    pub data: Option<Value>,
}

/// 通用指令通道（由传输层实现）
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn send_command(
        &self,
        client_id: &str,
        conversation_id: &str,
        conv_type: i32,
        op: CommandOp,
        payload: Value,
    ) -> Result<CommandAck>;
}
