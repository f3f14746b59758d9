//! 按应用串行化部署
//!
//! 同一应用同时只允许一个部署尝试持有锁；不同应用互不影响

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct AppLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AppLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取应用锁，持有期间其他同应用尝试排队等待
    pub async fn acquire(&self, app_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // 清理无人持有也无人等待的条目
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(app_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// 当前被持有或等待中的应用数量
    pub async fn len(&self) -> usize {
        let locks = self.locks.lock().await;
        locks
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}
