//! 运行时注册表与白名单的共享持有者
//!
//! 每次部署在校验阶段取一份快照，管理接口的修改只影响之后开始校验的尝试

use tokio::sync::RwLock;
use tracing::info;

use crate::domain::policy::{PolicyCatalog, RuntimeRegistry};

pub struct PolicyStore {
    registry: RwLock<RuntimeRegistry>,
    catalog: RwLock<PolicyCatalog>,
}

impl PolicyStore {
    pub fn new(registry: RuntimeRegistry, catalog: PolicyCatalog) -> Self {
        Self {
            registry: RwLock::new(registry),
            catalog: RwLock::new(catalog),
        }
    }

    /// 内置注册表与白名单
    pub fn builtin() -> Self {
        Self::new(RuntimeRegistry::builtin(), PolicyCatalog::builtin())
    }

    /// 当前配置的快照
    pub async fn snapshot(&self) -> (RuntimeRegistry, PolicyCatalog) {
        let registry = self.registry.read().await.clone();
        let catalog = self.catalog.read().await.clone();
        (registry, catalog)
    }

    /// 替换某个运行时的白名单
    ///
    /// 运行时未注册时返回 false
    pub async fn set_packages(&self, runtime: &str, packages: Vec<String>) -> bool {
        if self.registry.read().await.base_image(runtime).is_none() {
            return false;
        }
        info!(runtime = %runtime, count = packages.len(), "Approved packages replaced");
        self.catalog.write().await.replace(runtime, packages);
        true
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::builtin()
    }
}
