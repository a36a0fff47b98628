//! 数据访问层 - 每张表一个专门的操作模块

pub mod conversation;
pub mod message;

pub use conversation::{ConversationDao, ConversationRow};
pub use message::MessageDao;
