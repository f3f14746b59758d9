//! 应用记录存储
//!
//! 简单的键值存储：按 ID 读取、按 owner 列出、插入、单条更新。
//! `JsonFileStore` 把全部记录保存到一个 JSON 文件（原子写入），`MemoryStore` 用于测试。

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::app::{AppStatus, Application, User};

/// 记录存储协作方
#[async_trait]
pub trait AppStore: Send + Sync {
    async fn get_app(&self, id: &str) -> anyhow::Result<Option<Application>>;

    async fn list_apps_by_owner(&self, owner_id: &str) -> anyhow::Result<Vec<Application>>;

    async fn insert_app(&self, app: Application) -> anyhow::Result<()>;

    /// 整条替换已有记录，记录不存在时返回错误
    async fn update_app(&self, app: Application) -> anyhow::Result<()>;

    async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>>;

    /// 按源码平台用户名插入或更新凭证，返回最终记录
    async fn upsert_user(&self, source_login: &str, token: &str) -> anyhow::Result<User>;

    /// 只更新应用状态
    async fn update_status(&self, id: &str, status: AppStatus) -> anyhow::Result<()> {
        let mut app = self
            .get_app(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("application '{}' not found", id))?;
        app.set_status(status);
        self.update_app(app).await
    }
}

/// 存储内容（与 db.json 结构一致）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    apps: Vec<Application>,
}

impl StoreData {
    fn replace_app(&mut self, mut app: Application) -> anyhow::Result<()> {
        let slot = self
            .apps
            .iter_mut()
            .find(|a| a.id == app.id)
            .ok_or_else(|| anyhow::anyhow!("application '{}' not found", app.id))?;
        app.updated_at = Utc::now();
        *slot = app;
        Ok(())
    }

    fn upsert_user(&mut self, source_login: &str, token: &str) -> User {
        if let Some(user) = self.users.iter_mut().find(|u| u.source_login == source_login) {
            user.token = token.to_string();
            return user.clone();
        }
        let user = User::new(source_login, token);
        self.users.push(user.clone());
        user
    }
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppStore for MemoryStore {
    async fn get_app(&self, id: &str) -> anyhow::Result<Option<Application>> {
        Ok(self.data.read().await.apps.iter().find(|a| a.id == id).cloned())
    }

    async fn list_apps_by_owner(&self, owner_id: &str) -> anyhow::Result<Vec<Application>> {
        let data = self.data.read().await;
        Ok(data
            .apps
            .iter()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn insert_app(&self, app: Application) -> anyhow::Result<()> {
        self.data.write().await.apps.push(app);
        Ok(())
    }

    async fn update_app(&self, app: Application) -> anyhow::Result<()> {
        self.data.write().await.replace_app(app)
    }

    async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>> {
        Ok(self.data.read().await.users.iter().find(|u| u.id == id).cloned())
    }

    async fn upsert_user(&self, source_login: &str, token: &str) -> anyhow::Result<User> {
        Ok(self.data.write().await.upsert_user(source_login, token))
    }
}

/// JSON 文件存储
///
/// 每次修改后整体写回文件：先写临时文件再原子重命名
pub struct JsonFileStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl JsonFileStore {
    /// 打开存储文件，文件不存在时从空数据开始
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let data = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            let data: StoreData = serde_json::from_str(&content)?;
            info!(
                path = %path.display(),
                users = data.users.len(),
                apps = data.apps.len(),
                "Loaded record store"
            );
            data
        } else {
            info!(path = %path.display(), "Record store not found, starting empty");
            StoreData::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// 保存到文件（原子写入），调用方需持有写锁
    async fn persist(&self, data: &StoreData) -> anyhow::Result<()> {
        let temp_path = self.path.with_extension("json.tmp");

        // 确保目录存在
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(data)?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), "Saved record store");
        Ok(())
    }
}

#[async_trait]
impl AppStore for JsonFileStore {
    async fn get_app(&self, id: &str) -> anyhow::Result<Option<Application>> {
        Ok(self.data.read().await.apps.iter().find(|a| a.id == id).cloned())
    }

    async fn list_apps_by_owner(&self, owner_id: &str) -> anyhow::Result<Vec<Application>> {
        let data = self.data.read().await;
        Ok(data
            .apps
            .iter()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn insert_app(&self, app: Application) -> anyhow::Result<()> {
        let mut data = self.data.write().await;
        let mut next = data.clone();
        next.apps.push(app);
        self.persist(&next).await?;
        *data = next;
        Ok(())
    }

    async fn update_app(&self, app: Application) -> anyhow::Result<()> {
        let mut data = self.data.write().await;
        let mut next = data.clone();
        next.replace_app(app)?;
        self.persist(&next).await?;
        *data = next;
        Ok(())
    }

    async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>> {
        Ok(self.data.read().await.users.iter().find(|u| u.id == id).cloned())
    }

    async fn upsert_user(&self, source_login: &str, token: &str) -> anyhow::Result<User> {
        let mut data = self.data.write().await;
        let mut next = data.clone();
        let user = next.upsert_user(source_login, token);
        self.persist(&next).await?;
        *data = next;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryStore::new();
        let user = store.upsert_user("octocat", "t1").await.unwrap();

        let app = Application::new(&user.id, "blog");
        let app_id = app.id.clone();
        store.insert_app(app).await.unwrap();
        store.insert_app(Application::new("someone-else", "shop")).await.unwrap();

        let apps = store.list_apps_by_owner(&user.id).await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "blog");

        store.update_status(&app_id, AppStatus::Running).await.unwrap();
        let app = store.get_app(&app_id).await.unwrap().unwrap();
        assert_eq!(app.status, AppStatus::Running);

        assert!(store.update_status("missing", AppStatus::Failed).await.is_err());
    }

    #[tokio::test]
    async fn test_upsert_user_replaces_token() {
        let store = MemoryStore::new();
        let first = store.upsert_user("octocat", "old").await.unwrap();
        let second = store.upsert_user("octocat", "new").await.unwrap();

        assert_eq!(first.id, second.id);
        let user = store.get_user(&first.id).await.unwrap().unwrap();
        assert_eq!(user.token, "new");
    }

    #[tokio::test]
    async fn test_json_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("db.json");

        let app_id = {
            let store = JsonFileStore::open(&path).await.unwrap();
            let user = store.upsert_user("octocat", "tok").await.unwrap();
            let mut app = Application::new(&user.id, "blog");
            let id = app.id.clone();
            store.insert_app(app.clone()).await.unwrap();

            app.repo_name = Some("blog-repo".into());
            app.set_status(AppStatus::Running);
            store.update_app(app).await.unwrap();
            id
        };

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let app = reopened.get_app(&app_id).await.unwrap().unwrap();
        assert_eq!(app.status, AppStatus::Running);
        assert_eq!(app.repo_name.as_deref(), Some("blog-repo"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(JsonFileStore::open(&path).await.is_err());
    }
}
