//! 同步模块 - 本地缓存与远端历史服务的仲裁
//!
//! 职责：
//! - 判定一次查询能否由缓存作答，不能时发起最小代价的网络拉取
//! - 把拉取结果与缓存段拼接成无缺口序列并落库（断点在此被清除）
//! - 离线 / 超时情况下按回退策略给出已确认连续的数据

pub mod coordinator;

pub use coordinator::{QueryTarget, SyncCoordinator};

/// 单次查询的缓存 / 网络仲裁模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// 只读缓存，不发网络请求
    CacheOnly,
    /// 只走网络，结果原样返回
    NetworkOnly,
    /// 先缓存后补网络（默认）：连续段够用就不发请求
    CacheThenMerge,
    /// 走网络但带上本地截断提示，让服务端跳过客户端已有的数据
    NetworkWithCacheHint,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::CacheThenMerge
    }
}
