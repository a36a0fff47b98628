//! 错误类型定义
//!
//! 读路径与写路径对错误的处理策略不同：
//! - Timeout / Network：读路径允许回退到本地缓存，写路径标记发送失败
//! - Service：服务端业务拒绝，原样上抛，不重试、不被缓存回退掩盖
//! - Storage：读路径按缓存未命中处理；尽力而为的写入失败只记日志

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelaychatSDKError {
    /// 参数非法（如 limit 越界、缺少必要的标识符），不重试
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 设备离线，网络路径被短路
    #[error("Not connected")]
    NotConnected,

    /// 请求超时
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 传输层错误（未分类）
    #[error("Network error: {0}")]
    Network(String),

    /// 服务端业务错误（如权限不足、目标不存在）
    #[error("Service error [{code}]: {message}")]
    Service { code: i32, message: String },

    /// 本地持久化错误
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON 编解码错误
    #[error("JSON error: {0}")]
    Json(String),

    /// 调用方取消了进行中的操作
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// 当前状态下不允许的操作
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<rusqlite::Error> for RelaychatSDKError {
    fn from(error: rusqlite::Error) -> Self {
        RelaychatSDKError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for RelaychatSDKError {
    fn from(error: serde_json::Error) -> Self {
        RelaychatSDKError::Json(error.to_string())
    }
}

impl RelaychatSDKError {
    /// 读路径上该错误是否允许回退到已确认连续的缓存数据
    pub fn allows_cache_fallback(&self) -> bool {
        matches!(
            self,
            RelaychatSDKError::Timeout(_)
                | RelaychatSDKError::Network(_)
                | RelaychatSDKError::NotConnected
        )
    }

    /// 判断是否是服务端业务错误
    pub fn is_service_error(&self) -> bool {
        matches!(self, RelaychatSDKError::Service { .. })
    }

    /// 获取服务端错误码（如果这是一个业务错误）
    pub fn service_code(&self) -> Option<i32> {
        match self {
            RelaychatSDKError::Service { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelaychatSDKError>;
