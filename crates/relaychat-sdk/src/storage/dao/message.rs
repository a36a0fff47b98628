//! 消息数据访问层 - 封装消息缓存表的所有数据库操作
//!
//! 功能包括：
//! - 按位置读取消息与断点标记
//! - 沿时间轴向旧方向的分页扫描
//! - 连续消息段的事务性落库（断点清除只发生在这里）
//! - 未发送草稿的暂存与移除

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::message::{Message, MessageStatus};

fn status_to_code(status: MessageStatus) -> i32 {
    match status {
        MessageStatus::Sending => 0,
        MessageStatus::Sent => 1,
        MessageStatus::Failed => 2,
        MessageStatus::Recalled => 3,
    }
}

fn status_from_code(code: i32) -> MessageStatus {
    match code {
        1 => MessageStatus::Sent,
        2 => MessageStatus::Failed,
        3 => MessageStatus::Recalled,
        _ => MessageStatus::Sending,
    }
}

/// 消息数据访问对象
pub struct MessageDao<'a> {
    conn: &'a Connection,
}

impl<'a> MessageDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 覆盖写入一条缓存记录，断点标记由调用方给定
    pub fn upsert(&self, message: &Message, breakpoint: bool) -> Result<()> {
        let sql = "INSERT OR REPLACE INTO message (
            conversation_id, message_id, timestamp, from_uid, content, status,
            breakpoint, delivered_at, read_at, update_at, mentioned, unique_token
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

        self.conn.execute(
            sql,
            params![
                message.conversation_id,
                message.message_id,
                message.timestamp,
                message.from,
                message.content,
                status_to_code(message.status),
                breakpoint,
                message.delivered_at,
                message.read_at,
                message.update_at,
                message.mentioned,
                message.unique_token,
            ],
        )?;
        Ok(())
    }

    /// 查询某条记录当前的断点标记，记录不存在时返回 None
    pub fn breakpoint_of(&self, conversation_id: &str, message_id: &str) -> Result<Option<bool>> {
        let sql = "SELECT breakpoint FROM message WHERE conversation_id = ?1 AND message_id = ?2";
        let flag = self
            .conn
            .query_row(sql, params![conversation_id, message_id], |row| row.get(0))
            .optional()?;
        Ok(flag)
    }

    /// 按 message_id 读取记录及其断点标记
    pub fn get(&self, conversation_id: &str, message_id: &str) -> Result<Option<(Message, bool)>> {
        let sql = "SELECT * FROM message WHERE conversation_id = ?1 AND message_id = ?2";
        let mut stmt = self.conn.prepare(sql)?;
        let found = stmt
            .query_row(params![conversation_id, message_id], |row| {
                Ok((row_to_message(row)?, row.get::<_, bool>("breakpoint")?))
            })
            .optional()?;
        Ok(found)
    }

    /// 按时间戳读取记录（message_id 未知的场景），同一时刻取 id 最大的那条
    pub fn get_by_timestamp(
        &self,
        conversation_id: &str,
        timestamp: i64,
    ) -> Result<Option<(Message, bool)>> {
        let sql = "SELECT * FROM message WHERE conversation_id = ?1 AND timestamp = ?2
                   ORDER BY message_id DESC LIMIT 1";
        let mut stmt = self.conn.prepare(sql)?;
        let found = stmt
            .query_row(params![conversation_id, timestamp], |row| {
                Ok((row_to_message(row)?, row.get::<_, bool>("breakpoint")?))
            })
            .optional()?;
        Ok(found)
    }

    /// 从给定位置向旧方向扫描，返回至多 limit 条记录（最新在前）
    ///
    /// 位置为 None 时从最新记录开始；message_id 为空时只按时间戳截断。
    pub fn list_before(
        &self,
        conversation_id: &str,
        position: Option<(&str, i64)>,
        limit: usize,
    ) -> Result<Vec<(Message, bool)>> {
        let mut sql = String::from("SELECT * FROM message WHERE conversation_id = ?");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(conversation_id.to_string())];

        // 构建位置截断条件
        match position {
            Some((message_id, timestamp)) if !message_id.is_empty() => {
                sql.push_str(" AND (timestamp < ? OR (timestamp = ? AND message_id < ?))");
                params.push(Box::new(timestamp));
                params.push(Box::new(timestamp));
                params.push(Box::new(message_id.to_string()));
            }
            Some((_, timestamp)) => {
                sql.push_str(" AND timestamp < ?");
                params.push(Box::new(timestamp));
            }
            None => {}
        }
        sql.push_str(" ORDER BY timestamp DESC, message_id DESC LIMIT ?");
        params.push(Box::new(limit as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(&param_refs[..], |row| {
            Ok((row_to_message(row)?, row.get::<_, bool>("breakpoint")?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// 最新一条记录
    pub fn latest(&self, conversation_id: &str) -> Result<Option<(Message, bool)>> {
        let sql = "SELECT * FROM message WHERE conversation_id = ?1
                   ORDER BY timestamp DESC, message_id DESC LIMIT 1";
        let mut stmt = self.conn.prepare(sql)?;
        let found = stmt
            .query_row(params![conversation_id], |row| {
                Ok((row_to_message(row)?, row.get::<_, bool>("breakpoint")?))
            })
            .optional()?;
        Ok(found)
    }

    /// 断点标记等于给定值的最新记录
    pub fn latest_with_breakpoint(
        &self,
        conversation_id: &str,
        breakpoint: bool,
    ) -> Result<Option<Message>> {
        let sql = "SELECT * FROM message WHERE conversation_id = ?1 AND breakpoint = ?2
                   ORDER BY timestamp DESC, message_id DESC LIMIT 1";
        let mut stmt = self.conn.prepare(sql)?;
        let found = stmt
            .query_row(params![conversation_id, breakpoint], |row| {
                row_to_message(row)
            })
            .optional()?;
        Ok(found)
    }

    /// 会话内缓存的消息数量
    pub fn count(&self, conversation_id: &str) -> Result<i64> {
        let sql = "SELECT COUNT(*) FROM message WHERE conversation_id = ?1";
        let count = self
            .conn
            .query_row(sql, params![conversation_id], |row| row.get(0))?;
        Ok(count)
    }

    /// 事务性写入一段已证明连续的消息（按排序法则升序）
    ///
    /// 除最旧一条外全部写为 breakpoint = false；最旧一条与更旧记录的
    /// 连续性仍然未知，保留既有标记，没有既有记录时写为 true。
    /// 因此把一条带断点的边界记录作为非最旧成员重新写入，断点即被清除。
    pub fn insert_continuous(&self, messages: &[Message], conversation_id: &str) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        for (idx, message) in messages.iter().enumerate() {
            let breakpoint = if idx == 0 {
                self.breakpoint_of(conversation_id, &message.message_id)?
                    .unwrap_or(true)
            } else {
                false
            };
            self.upsert(message, breakpoint)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// 单条写入
    ///
    /// 已有记录只更新内容字段，断点标记不动；新记录的断点标记取
    /// is_patch：推送 / 补丁来源的记录连续性未知，自己刚发出的消息
    /// 则直接衔接可见的尾部。
    pub fn insert_or_patch(&self, message: &Message, is_patch: bool) -> Result<()> {
        match self.breakpoint_of(&message.conversation_id, &message.message_id)? {
            Some(flag) => self.upsert(message, flag),
            None => self.upsert(message, is_patch),
        }
    }

    /// 按 message_id 更新补丁字段（内容、状态、补丁时间）
    pub fn update_for_patch(&self, message: &Message) -> Result<bool> {
        let sql = "UPDATE message SET content = ?1, status = ?2, update_at = ?3
                   WHERE conversation_id = ?4 AND message_id = ?5";
        let affected = self.conn.execute(
            sql,
            params![
                message.content,
                status_to_code(message.status),
                message.update_at,
                message.conversation_id,
                message.message_id,
            ],
        )?;
        Ok(affected > 0)
    }

    /// 暂存一条未发送成功的草稿，按幂等 token 去重
    pub fn insert_local(&self, message: &Message) -> Result<()> {
        let sql = "INSERT OR REPLACE INTO local_message (
            conversation_id, unique_token, timestamp, from_uid, content, status
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)";
        self.conn.execute(
            sql,
            params![
                message.conversation_id,
                message.unique_token,
                message.timestamp,
                message.from,
                message.content,
                status_to_code(message.status),
            ],
        )?;
        Ok(())
    }

    /// 移除草稿
    pub fn remove_local(&self, message: &Message) -> Result<()> {
        let sql = "DELETE FROM local_message WHERE conversation_id = ?1 AND unique_token = ?2";
        self.conn
            .execute(sql, params![message.conversation_id, message.unique_token])?;
        Ok(())
    }

    /// 会话内暂存的草稿数量
    pub fn count_local(&self, conversation_id: &str) -> Result<i64> {
        let sql = "SELECT COUNT(*) FROM local_message WHERE conversation_id = ?1";
        let count = self
            .conn
            .query_row(sql, params![conversation_id], |row| row.get(0))?;
        Ok(count)
    }
}

/// 将数据库行转换为消息实体
fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        conversation_id: row.get("conversation_id")?,
        message_id: row.get("message_id")?,
        timestamp: row.get("timestamp")?,
        from: row.get("from_uid")?,
        content: row.get("content")?,
        status: status_from_code(row.get("status")?),
        delivered_at: row.get("delivered_at")?,
        read_at: row.get("read_at")?,
        update_at: row.get("update_at")?,
        mentioned: row.get("mentioned")?,
        unique_token: row.get("unique_token")?,
    })
}
