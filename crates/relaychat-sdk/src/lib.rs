//! Relaychat SDK - 会话消息同步引擎
//!
//! 核心能力：
//! - 📡 本地缓存与远端历史服务的仲裁：连续段够用绝不发请求
//! - 🧩 断点模型：缓存连续性未确认的边界只有网络拉取能跨越
//! - 💬 外发管线：发送 / 修改 / 撤回的乐观状态机与服务端 ack 对账
//! - ⚙️ 会话属性：点路径寻址的属性树 + 挂起字段操作（确认后提交）
//! - 🔌 传输与存储通过窄接口注入，没有进程级单例
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relaychat_sdk::{ClientOptions, MessageStore, RelaychatClient};
//! # use relaychat_sdk::{CommandChannel, MessageHistoryService, NetworkMonitor};
//!
//! # async fn example(
//! #     history: Arc<dyn MessageHistoryService>,
//! #     commands: Arc<dyn CommandChannel>,
//! #     network: Arc<NetworkMonitor>,
//! # ) -> relaychat_sdk::Result<()> {
//! let store = Arc::new(MessageStore::open("/path/to/cache.db")?);
//! let client = RelaychatClient::new(
//!     "user123",
//!     ClientOptions::default(),
//!     store,
//!     history,
//!     commands,
//!     network,
//! );
//!
//! let conversation = client.conversation("conv456");
//! let messages = conversation.query_messages(20).await?;
//! # let _ = messages;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod conversation;
pub mod error;
pub mod events;
pub mod interval;
pub mod message;
pub mod network;
pub mod remote;
pub mod storage;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

// 重新导出核心类型，方便使用
pub use client::{ClientOptions, RelaychatClient};
pub use conversation::{
    attrs::{AttrValue, FieldOperation},
    Conversation, ConversationType, SendOptions,
};
pub use error::{RelaychatSDKError, Result};
pub use events::PushEvent;
pub use interval::{IntervalBound, MessageInterval, QueryDirection, MAX_QUERY_LIMIT};
pub use message::{Message, MessageStatus};
pub use network::{NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use remote::{CommandAck, CommandChannel, CommandOp, MessageHistoryService};
pub use storage::{ConversationRow, MessageStore};
pub use sync::{CachePolicy, QueryTarget, SyncCoordinator};
