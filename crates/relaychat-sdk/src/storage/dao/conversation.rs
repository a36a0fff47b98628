//! 会话数据访问层 - 会话行的未读数、回执时间与属性快照

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;

/// 会话持久化行
#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub conversation_id: String,
    /// 属性树的 JSON 快照
    pub instance_data: String,
    pub last_message_at: i64,
    pub last_read_at: i64,
    pub last_delivered_at: i64,
    pub unread_count: i32,
    pub unread_mentioned: bool,
}

/// 会话数据访问对象
pub struct ConversationDao<'a> {
    conn: &'a Connection,
}

impl<'a> ConversationDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 写入 / 覆盖属性快照，计数字段保持不变
    pub fn upsert(&self, conversation_id: &str, instance_data: &str) -> Result<()> {
        let sql = "INSERT INTO conversation (conversation_id, instance_data) VALUES (?1, ?2)
                   ON CONFLICT(conversation_id) DO UPDATE SET instance_data = excluded.instance_data";
        self.conn.execute(sql, params![conversation_id, instance_data])?;
        Ok(())
    }

    /// 更新对端回执时间
    pub fn update_times(
        &self,
        conversation_id: &str,
        last_read_at: i64,
        last_delivered_at: i64,
    ) -> Result<()> {
        let sql = "INSERT INTO conversation (conversation_id, last_read_at, last_delivered_at)
                   VALUES (?1, ?2, ?3)
                   ON CONFLICT(conversation_id) DO UPDATE SET
                       last_read_at = excluded.last_read_at,
                       last_delivered_at = excluded.last_delivered_at";
        self.conn
            .execute(sql, params![conversation_id, last_read_at, last_delivered_at])?;
        Ok(())
    }

    /// 更新未读计数
    pub fn update_unread(
        &self,
        conversation_id: &str,
        unread_count: i32,
        mentioned: bool,
    ) -> Result<()> {
        let sql = "INSERT INTO conversation (conversation_id, unread_count, unread_mentioned)
                   VALUES (?1, ?2, ?3)
                   ON CONFLICT(conversation_id) DO UPDATE SET
                       unread_count = excluded.unread_count,
                       unread_mentioned = excluded.unread_mentioned";
        self.conn
            .execute(sql, params![conversation_id, unread_count, mentioned])?;
        Ok(())
    }

    /// 更新最新消息时间
    pub fn update_last_message_at(&self, conversation_id: &str, last_message_at: i64) -> Result<()> {
        let sql = "INSERT INTO conversation (conversation_id, last_message_at) VALUES (?1, ?2)
                   ON CONFLICT(conversation_id) DO UPDATE SET
                       last_message_at = excluded.last_message_at";
        self.conn
            .execute(sql, params![conversation_id, last_message_at])?;
        Ok(())
    }

    pub fn get(&self, conversation_id: &str) -> Result<Option<ConversationRow>> {
        let sql = "SELECT * FROM conversation WHERE conversation_id = ?1";
        let mut stmt = self.conn.prepare(sql)?;
        let row = stmt
            .query_row(params![conversation_id], |row| row_to_conversation(row))
            .optional()?;
        Ok(row)
    }
}

fn row_to_conversation(row: &Row) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        conversation_id: row.get("conversation_id")?,
        instance_data: row.get("instance_data")?,
        last_message_at: row.get("last_message_at")?,
        last_read_at: row.get("last_read_at")?,
        last_delivered_at: row.get("last_delivered_at")?,
        unread_count: row.get("unread_count")?,
        unread_mentioned: row.get("unread_mentioned")?,
    })
}
