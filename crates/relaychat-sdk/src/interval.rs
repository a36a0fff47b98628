//! 消息区间模型 - 历史查询的边界与方向
//!
//! 纯值类型，不做任何 I/O。`direction` 决定哪一端是「近端」
//! （贴着 limit 截断的位置），哪一端是「远端」（发给服务端的截断提示，
//! 服务端一旦到达远端就停止返回，避免重复下载客户端已有的数据）。

use serde::{Deserialize, Serialize};

use crate::error::{RelaychatSDKError, Result};

/// 查询允许的最大条数
pub const MAX_QUERY_LIMIT: usize = 1000;

/// 区间的一端，由消息位置（id + 时间戳）和开闭标记组成
///
/// `closed = true` 时边界消息本身包含在结果内。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalBound {
    pub message_id: String,
    pub timestamp: i64,
    pub closed: bool,
}

impl IntervalBound {
    pub fn new(message_id: impl Into<String>, timestamp: i64, closed: bool) -> Self {
        Self {
            message_id: message_id.into(),
            timestamp,
            closed,
        }
    }
}

/// 历史查询区间，起止边界都可缺省
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInterval {
    pub start: Option<IntervalBound>,
    pub end: Option<IntervalBound>,
}

impl MessageInterval {
    pub fn new(start: Option<IntervalBound>, end: Option<IntervalBound>) -> Self {
        Self { start, end }
    }

    /// 只有起点的区间（翻页查询）
    pub fn from_start(start: IntervalBound) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }
}

/// 查询方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryDirection {
    /// 从新到旧（默认，向上翻历史）
    NewToOld,
    /// 从旧到新
    OldToNew,
}

impl QueryDirection {
    /// 协议层方向编码
    pub fn code(&self) -> i32 {
        match self {
            QueryDirection::NewToOld => 0,
            QueryDirection::OldToNew => 1,
        }
    }
}

impl Default for QueryDirection {
    fn default() -> Self {
        QueryDirection::NewToOld
    }
}

/// 校验查询条数限制，越界立即报参数错误
pub fn check_limit(limit: usize) -> Result<()> {
    if limit == 0 || limit > MAX_QUERY_LIMIT {
        return Err(RelaychatSDKError::InvalidArgument(format!(
            "limit should be in [1, {}], got {}",
            MAX_QUERY_LIMIT, limit
        )));
    }
    Ok(())
}
