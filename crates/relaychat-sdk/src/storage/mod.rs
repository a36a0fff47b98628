//! 存储模块 - 会话消息缓存的持久化层
//!
//! 分层设计：
//! - MessageStore: 统一入口，持有共享连接并负责建表
//! - DAO Layer: 每张表一个专门的操作模块
//!
//! 断点（breakpoint）是缓存连续性的唯一标记：为 true 表示该记录与
//! 更旧一条记录之间的连续性未确认，读取方不得越过它直接信任缓存。
//! 断点只会被 [`MessageStore::insert_continuous_messages`] 清除，
//! 也就是只有同步协调器用网络拉取证明了连续性之后。
//!
//! 共享同一把连接互斥锁意味着连续段落库天然与并发的断点读取串行化。

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::Result;
use crate::message::{sort_dedup_ascending, Message};

pub mod dao;

pub use dao::{ConversationDao, ConversationRow, MessageDao};

/// 建表语句，幂等
pub(crate) fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS message (
            conversation_id TEXT NOT NULL,
            message_id      TEXT NOT NULL,
            timestamp       INTEGER NOT NULL DEFAULT 0,
            from_uid        TEXT NOT NULL DEFAULT '',
            content         TEXT NOT NULL DEFAULT '',
            status          INTEGER NOT NULL DEFAULT 0,
            breakpoint      INTEGER NOT NULL DEFAULT 0,
            delivered_at    INTEGER NOT NULL DEFAULT 0,
            read_at         INTEGER NOT NULL DEFAULT 0,
            update_at       INTEGER NOT NULL DEFAULT 0,
            mentioned       INTEGER NOT NULL DEFAULT 0,
            unique_token    TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (conversation_id, message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_message_conv_ts
            ON message (conversation_id, timestamp, message_id);
        CREATE INDEX IF NOT EXISTS idx_message_conv_breakpoint
            ON message (conversation_id, breakpoint, timestamp);
        CREATE TABLE IF NOT EXISTS local_message (
            conversation_id TEXT NOT NULL,
            unique_token    TEXT NOT NULL,
            timestamp       INTEGER NOT NULL DEFAULT 0,
            from_uid        TEXT NOT NULL DEFAULT '',
            content         TEXT NOT NULL DEFAULT '',
            status          INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (conversation_id, unique_token)
        );
        CREATE TABLE IF NOT EXISTS conversation (
            conversation_id   TEXT PRIMARY KEY,
            instance_data     TEXT NOT NULL DEFAULT '{}',
            last_message_at   INTEGER NOT NULL DEFAULT 0,
            last_read_at      INTEGER NOT NULL DEFAULT 0,
            last_delivered_at INTEGER NOT NULL DEFAULT 0,
            unread_count      INTEGER NOT NULL DEFAULT 0,
            unread_mentioned  INTEGER NOT NULL DEFAULT 0
        );",
    )?;
    Ok(())
}

/// 消息缓存的统一入口
///
/// 所有操作共享一把连接互斥锁；任何写入失败都以 Storage 错误上抛，
/// 由调用方决定按缓存未命中处理还是记日志放行。
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl MessageStore {
    /// 打开（或创建）磁盘缓存库
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 内存库，测试与一次性会话用
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// 按位置读取单条记录及其断点标记；message_id 为空时退化为时间戳查找
    pub fn get_message(
        &self,
        message_id: &str,
        timestamp: i64,
        conversation_id: &str,
    ) -> Result<Option<(Message, bool)>> {
        self.with_conn(|conn| {
            let dao = MessageDao::new(conn);
            if message_id.is_empty() {
                dao.get_by_timestamp(conversation_id, timestamp)
            } else {
                dao.get(conversation_id, message_id)
            }
        })
    }

    /// 从给定位置向旧方向取至多 limit 条（最新在前），附带断点标记
    pub fn get_messages(
        &self,
        message_id: &str,
        timestamp: i64,
        limit: usize,
        conversation_id: &str,
    ) -> Result<Vec<(Message, bool)>> {
        self.with_conn(|conn| {
            let dao = MessageDao::new(conn);
            let position = if message_id.is_empty() && timestamp <= 0 {
                None
            } else {
                Some((message_id, timestamp))
            };
            dao.list_before(conversation_id, position, limit)
        })
    }

    pub fn get_latest_message(&self, conversation_id: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            Ok(MessageDao::new(conn)
                .latest(conversation_id)?
                .map(|(message, _)| message))
        })
    }

    pub fn get_latest_message_with_breakpoint(
        &self,
        conversation_id: &str,
        breakpoint: bool,
    ) -> Result<Option<Message>> {
        self.with_conn(|conn| MessageDao::new(conn).latest_with_breakpoint(conversation_id, breakpoint))
    }

    pub fn get_message_count(&self, conversation_id: &str) -> Result<i64> {
        self.with_conn(|conn| MessageDao::new(conn).count(conversation_id))
    }

    /// 落库一段已证明连续的消息
    ///
    /// 入参顺序不限，内部按排序法则升序并按 message_id 去重后写入，
    /// 同一批次重放的结果完全一致。
    pub fn insert_continuous_messages(
        &self,
        messages: &[Message],
        conversation_id: &str,
    ) -> Result<()> {
        let batch = sort_dedup_ascending(messages.to_vec());
        self.with_conn(|conn| MessageDao::new(conn).insert_continuous(&batch, conversation_id))
    }

    /// 单条写入；is_patch 表示该记录来自推送 / 补丁（连续性未知）
    pub fn insert_message(&self, message: &Message, is_patch: bool) -> Result<()> {
        self.with_conn(|conn| MessageDao::new(conn).insert_or_patch(message, is_patch))
    }

    /// 修改 / 撤回后的补丁写入
    pub fn update_message_for_patch(&self, message: &Message) -> Result<()> {
        self.with_conn(|conn| {
            MessageDao::new(conn).update_for_patch(message)?;
            Ok(())
        })
    }

    /// 暂存发送失败的草稿
    pub fn insert_local_message(&self, message: &Message) -> Result<()> {
        self.with_conn(|conn| MessageDao::new(conn).insert_local(message))
    }

    /// 移除草稿
    pub fn remove_local_message(&self, message: &Message) -> Result<()> {
        self.with_conn(|conn| MessageDao::new(conn).remove_local(message))
    }

    // ---- 会话行 ----

    pub fn insert_conversation(&self, conversation_id: &str, instance_data: &str) -> Result<()> {
        self.with_conn(|conn| ConversationDao::new(conn).upsert(conversation_id, instance_data))
    }

    pub fn update_conversation_times(
        &self,
        conversation_id: &str,
        last_read_at: i64,
        last_delivered_at: i64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            ConversationDao::new(conn).update_times(conversation_id, last_read_at, last_delivered_at)
        })
    }

    pub fn update_conversation_unread(
        &self,
        conversation_id: &str,
        unread_count: i32,
        mentioned: bool,
    ) -> Result<()> {
        self.with_conn(|conn| {
            ConversationDao::new(conn).update_unread(conversation_id, unread_count, mentioned)
        })
    }

    pub fn update_conversation_last_message_at(
        &self,
        conversation_id: &str,
        last_message_at: i64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            ConversationDao::new(conn).update_last_message_at(conversation_id, last_message_at)
        })
    }

    pub fn get_conversation_row(&self, conversation_id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| ConversationDao::new(conn).get(conversation_id))
    }
}
