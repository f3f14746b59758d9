//! 部署日志中心
//!
//! 每次尝试一个广播通道。尝试结束后通道关闭，只保留最后若干行，
//! 之后的订阅者收到回放

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use crate::domain::deploy::LogLine;

/// 日志通道容量
const LOG_CHANNEL_CAPACITY: usize = 256;

enum Channel {
    Live(broadcast::Sender<LogLine>),
    Closed(Vec<LogLine>),
}

struct Entry {
    channel: Channel,
    created_at: DateTime<Utc>,
}

/// 订阅结果
pub enum LogSubscription {
    /// 尝试进行中，实时接收
    Live(broadcast::Receiver<LogLine>),
    /// 尝试已结束，回放保留的日志
    Replay(Vec<LogLine>),
}

#[derive(Default)]
pub struct LogHub {
    entries: RwLock<HashMap<String, Entry>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为尝试打开日志通道
    pub async fn open(&self, task_id: &str) -> broadcast::Sender<LogLine> {
        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        self.entries.write().await.insert(
            task_id.to_string(),
            Entry {
                channel: Channel::Live(sender.clone()),
                created_at: Utc::now(),
            },
        );
        sender
    }

    pub async fn subscribe(&self, task_id: &str) -> Option<LogSubscription> {
        let entries = self.entries.read().await;
        entries.get(task_id).map(|entry| match &entry.channel {
            Channel::Live(sender) => LogSubscription::Live(sender.subscribe()),
            Channel::Closed(tail) => LogSubscription::Replay(tail.clone()),
        })
    }

    /// 关闭通道并保留日志尾部
    ///
    /// 部署上下文持有的发送者释放后，实时订阅者收到 `Closed`
    pub async fn close(&self, task_id: &str, tail: Vec<LogLine>) {
        if let Some(entry) = self.entries.write().await.get_mut(task_id) {
            entry.channel = Channel::Closed(tail);
        }
    }

    /// 移除超过 `max_age_hours` 的已关闭通道
    pub async fn cleanup_expired(&self, max_age_hours: i64) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            matches!(entry.channel, Channel::Live(_))
                || (now - entry.created_at).num_hours() < max_age_hours
        });
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
