//! 同步协调器
//!
//! 回答「给我位置 P 之前的至多 N 条消息」，在尽量省流量的前提下保证：
//! 只要历史没有真正到头且设备在线，调用方拿到的条数不少于请求值。
//!
//! 断点不变式：任何查询都不会在没有一次跨越该缺口的网络拉取的情况下
//! 越过一条未确认的边（breakpoint = true 的记录）拼接结果。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RelaychatSDKError, Result};
use crate::interval::{check_limit, IntervalBound, MessageInterval, QueryDirection};
use crate::message::{sort_dedup_ascending, Message};
use crate::network::NetworkMonitor;
use crate::remote::MessageHistoryService;
use crate::storage::MessageStore;
use crate::sync::CachePolicy;

/// 查询目标会话
#[derive(Debug, Clone)]
pub struct QueryTarget {
    pub conversation_id: String,
    pub conv_type: i32,
    /// 该会话是否允许本地缓存（全局开关与会话类型共同决定，
    /// 例如临时聊天室不落库）
    pub cache_enabled: bool,
}

/// 同步协调器
///
/// 所有协作方都由构造时注入；同一个实例服务多个会话，
/// 合并操作按会话单飞，互不相关的会话并行。
pub struct SyncCoordinator {
    client_id: String,
    store: Arc<MessageStore>,
    history: Arc<dyn MessageHistoryService>,
    network: Arc<NetworkMonitor>,
    /// 合并锁（每个会话一把，防止并发补洞交错破坏连续性链）
    merge_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncCoordinator {
    pub fn new(
        client_id: impl Into<String>,
        store: Arc<MessageStore>,
        history: Arc<dyn MessageHistoryService>,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            store,
            history,
            network,
            merge_locks: Mutex::new(HashMap::new()),
        }
    }

    /// 查询最新一页消息（无位置变体）
    ///
    /// 在线且缓存可用时带上远端截断提示：以最新的无断点记录为远端，
    /// 服务端一旦返回到该位置就停下，传输量与客户端落后程度无关。
    /// 空批次说明缓存已是最新；非空批次落库后改用廉价的本地读出结果。
    pub async fn query_latest(
        &self,
        target: &QueryTarget,
        limit: usize,
        policy: CachePolicy,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        check_limit(limit)?;

        if policy == CachePolicy::CacheOnly {
            return self.cache_page(target, "", 0, limit);
        }

        if !target.cache_enabled || policy == CachePolicy::NetworkOnly {
            if !self.network.is_online().await {
                return Err(RelaychatSDKError::NotConnected);
            }
            let fetched = self
                .fetch_from_server(target, None, None, QueryDirection::NewToOld, limit, cancel)
                .await?;
            if target.cache_enabled && !fetched.is_empty() {
                // 最新页锚定在时间轴尾部，整页本身无缺口，可作连续段落库
                self.persist_continuous(&target.conversation_id, &fetched);
            }
            return Ok(fetched);
        }

        let lock = self.merge_lock(&target.conversation_id).await;
        let _guard = lock.lock().await;

        if !self.network.is_online().await {
            debug!(
                "离线状态，最新页直接走缓存: conversation_id={}",
                target.conversation_id
            );
            return self.cache_page(target, "", 0, limit);
        }

        // 缓存量不足一页时不给截断提示，否则首次查询返回条数与 limit
        // 不符，调用方会误以为历史已经到头
        let cached_count = match self.store.get_message_count(&target.conversation_id) {
            Ok(count) => count,
            Err(e) => {
                warn!("读取缓存消息数失败，按空缓存处理: error={}", e);
                0
            }
        };
        let far_bound = if cached_count >= limit as i64 {
            match self
                .store
                .get_latest_message_with_breakpoint(&target.conversation_id, false)
            {
                Ok(Some(latest)) => Some(IntervalBound::new(
                    latest.message_id.clone(),
                    latest.timestamp,
                    false,
                )),
                Ok(None) => None,
                Err(e) => {
                    warn!("查找截断提示失败，放弃提示: error={}", e);
                    None
                }
            }
        } else {
            None
        };

        match self
            .fetch_from_server(
                target,
                None,
                far_bound,
                QueryDirection::NewToOld,
                limit,
                cancel,
            )
            .await
        {
            Ok(fetched) => {
                if fetched.is_empty() {
                    debug!(
                        "服务端无新消息，缓存已是最新: conversation_id={}",
                        target.conversation_id
                    );
                } else {
                    self.persist_continuous(&target.conversation_id, &fetched);
                }
                // 缺口闭合后由本地读伺服展示层
                self.cache_page(target, "", 0, limit)
            }
            Err(e) if e.allows_cache_fallback() => {
                info!(
                    "最新页拉取失败，回退本地缓存: conversation_id={}, error={}",
                    target.conversation_id, e
                );
                self.cache_page(target, "", 0, limit)
            }
            Err(e) => Err(e),
        }
    }

    /// 查询位置 P 之前（更旧）的至多 limit 条消息
    pub async fn query_before(
        &self,
        target: &QueryTarget,
        message_id: &str,
        timestamp: i64,
        limit: usize,
        policy: CachePolicy,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        check_limit(limit)?;
        if message_id.is_empty() && timestamp <= 0 {
            return Err(RelaychatSDKError::InvalidArgument(
                "query position requires message_id or timestamp".into(),
            ));
        }

        match policy {
            CachePolicy::CacheOnly => {
                return self.cache_page(target, message_id, timestamp, limit);
            }
            CachePolicy::NetworkOnly => {
                if !self.network.is_online().await {
                    return Err(RelaychatSDKError::NotConnected);
                }
                // 结果原样返回，不写缓存
                return self
                    .fetch_from_server(
                        target,
                        Some(IntervalBound::new(message_id, timestamp, false)),
                        None,
                        QueryDirection::NewToOld,
                        limit,
                        cancel,
                    )
                    .await;
            }
            CachePolicy::CacheThenMerge | CachePolicy::NetworkWithCacheHint => {}
        }

        if !target.cache_enabled {
            if !self.network.is_online().await {
                return Err(RelaychatSDKError::NotConnected);
            }
            return self
                .fetch_from_server(
                    target,
                    Some(IntervalBound::new(message_id, timestamp, false)),
                    None,
                    QueryDirection::NewToOld,
                    limit,
                    cancel,
                )
                .await;
        }

        let lock = self.merge_lock(&target.conversation_id).await;
        let _guard = lock.lock().await;

        if !self.network.is_online().await {
            // 离线：尽力而为直接给缓存数据，不做断点评估
            debug!(
                "离线状态，直接走缓存: conversation_id={}",
                target.conversation_id
            );
            return self.cache_page(target, message_id, timestamp, limit);
        }

        let anchor = match self
            .store
            .get_message(message_id, timestamp, &target.conversation_id)
        {
            Ok(found) => found,
            Err(e) => {
                warn!("查询点读取失败，按缓存未命中处理: error={}", e);
                None
            }
        };

        match anchor {
            // 查询点缺失或本身带断点：缓存无法从这里作答，整页走网络
            None | Some((_, true)) => {
                self.fill_from_position(target, anchor, message_id, timestamp, limit, cancel)
                    .await
            }
            // 查询点已缓存且连续：先收集连续段，不足再补网络
            Some((_, false)) => {
                self.merge_with_cache(target, message_id, timestamp, limit, cancel)
                    .await
            }
        }
    }

    /// 区间查询：任意历史范围无法假定已缓存，始终直连网络，不写缓存
    pub async fn query_interval(
        &self,
        target: &QueryTarget,
        interval: &MessageInterval,
        direction: QueryDirection,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        check_limit(limit)?;
        if !self.network.is_online().await {
            return Err(RelaychatSDKError::NotConnected);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelaychatSDKError::Cancelled("interval query".into())),
            result = self.history.fetch_messages(
                &self.client_id,
                &target.conversation_id,
                target.conv_type,
                interval,
                direction,
                limit,
            ) => result,
        }
    }

    /// 查询点不可用时的整页拉取：把查询点记录本身并入批次，
    /// 借连续段落库清除它的断点，然后回读缓存返回
    async fn fill_from_position(
        &self,
        target: &QueryTarget,
        anchor: Option<(Message, bool)>,
        message_id: &str,
        timestamp: i64,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let fetched = self
            .fetch_from_server(
                target,
                Some(IntervalBound::new(message_id, timestamp, false)),
                None,
                QueryDirection::NewToOld,
                limit,
                cancel,
            )
            .await?;

        let mut batch: Vec<Message> = Vec::with_capacity(fetched.len() + 1);
        if let Some((record, _)) = anchor {
            batch.push(record);
        }
        batch.extend(fetched.iter().cloned());
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        self.persist_continuous(&target.conversation_id, &batch);

        let fetched_asc = sort_dedup_ascending(fetched);
        // 回读缓存，让合并 / 补丁后的状态生效；回读不完整时退回网络结果
        match self
            .store
            .get_messages(message_id, timestamp, limit, &target.conversation_id)
        {
            Ok(records) if records.len() >= fetched_asc.len() => {
                Ok(sort_dedup_ascending(records.into_iter().map(|(m, _)| m).collect()))
            }
            Ok(_) => Ok(fetched_asc),
            Err(e) => {
                warn!("合并后回读缓存失败，返回网络结果: error={}", e);
                Ok(fetched_asc)
            }
        }
    }

    /// 连续段够 limit 就直接返回，否则从段尾补拉剩余条数并落库消除断点
    async fn merge_with_cache(
        &self,
        target: &QueryTarget,
        message_id: &str,
        timestamp: i64,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let walk = match self
            .store
            .get_messages(message_id, timestamp, limit, &target.conversation_id)
        {
            Ok(records) => records,
            Err(e) => {
                warn!("缓存扫描失败，按空结果处理: error={}", e);
                Vec::new()
            }
        };

        // 收集连续前缀：遇到第一条带断点的记录即停，该记录不可信，不收
        let mut continuous: Vec<Message> = Vec::with_capacity(walk.len());
        for (message, breakpoint) in walk {
            if breakpoint {
                break;
            }
            continuous.push(message);
        }

        if continuous.len() >= limit {
            continuous.truncate(limit);
            return Ok(sort_dedup_ascending(continuous));
        }

        let rest = limit - continuous.len();
        // 从连续段的最旧一条继续向旧拉取；段为空时从查询点开始
        let (start_id, start_ts) = continuous
            .last()
            .map(|m| (m.message_id.clone(), m.timestamp))
            .unwrap_or_else(|| (message_id.to_string(), timestamp));

        match self
            .fetch_from_server(
                target,
                Some(IntervalBound::new(start_id, start_ts, false)),
                None,
                QueryDirection::NewToOld,
                rest,
                cancel,
            )
            .await
        {
            Ok(server_messages) => {
                debug!(
                    "缓存不足，网络补齐: conversation_id={}, cached={}, fetched={}",
                    target.conversation_id,
                    continuous.len(),
                    server_messages.len()
                );
                continuous.extend(server_messages);
                let merged = sort_dedup_ascending(continuous);
                self.persist_continuous(&target.conversation_id, &merged);
                Ok(merged)
            }
            // 已确认的数据绝不丢弃：传输类失败时退回连续段
            Err(e) if e.allows_cache_fallback() && !continuous.is_empty() => {
                info!(
                    "补齐拉取失败，返回已确认的连续段: conversation_id={}, count={}, error={}",
                    target.conversation_id,
                    continuous.len(),
                    e
                );
                Ok(sort_dedup_ascending(continuous))
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_from_server(
        &self,
        target: &QueryTarget,
        start: Option<IntervalBound>,
        end: Option<IntervalBound>,
        direction: QueryDirection,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let interval = MessageInterval::new(start, end);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(RelaychatSDKError::Cancelled("history fetch".into()))
            }
            result = self.history.fetch_messages(
                &self.client_id,
                &target.conversation_id,
                target.conv_type,
                &interval,
                direction,
                limit,
            ) => result,
        }
    }

    /// 缓存页直读（离线 / CacheOnly），不评估断点，升序返回
    fn cache_page(
        &self,
        target: &QueryTarget,
        message_id: &str,
        timestamp: i64,
        limit: usize,
    ) -> Result<Vec<Message>> {
        match self
            .store
            .get_messages(message_id, timestamp, limit, &target.conversation_id)
        {
            Ok(records) => Ok(sort_dedup_ascending(
                records.into_iter().map(|(m, _)| m).collect(),
            )),
            Err(e) => {
                warn!(
                    "读取本地缓存失败，按空结果处理: conversation_id={}, error={}",
                    target.conversation_id, e
                );
                Ok(Vec::new())
            }
        }
    }

    /// 落库连续段；网络已成功时缓存写失败不应让整个操作失败，只记日志
    fn persist_continuous(&self, conversation_id: &str, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }
        if let Err(e) = self
            .store
            .insert_continuous_messages(messages, conversation_id)
        {
            warn!(
                "连续消息段落库失败，跳过本次缓存写入: conversation_id={}, error={}",
                conversation_id, e
            );
        }
    }

    /// 获取会话级合并锁
    async fn merge_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.merge_locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
