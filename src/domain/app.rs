//! 应用与用户领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 应用生命周期状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Created,
    Building,
    Running,
    Failed,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Created => "created",
            AppStatus::Building => "building",
            AppStatus::Running => "running",
            AppStatus::Failed => "failed",
        }
    }
}

/// 套餐等级
///
/// 目前所有容器使用同一资源上限，等级仅作记录
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    #[default]
    Free,
    Hobby,
    Pro,
}

/// 应用记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    /// 所属用户 ID
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub plan: Plan,
    pub status: AppStatus,
    /// 最近一次成功部署绑定的仓库
    pub repo_name: Option<String>,
    /// 最近一次部署的日志摘录
    #[serde(default)]
    pub logs: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    /// 注册新应用
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            name: name.into(),
            plan: Plan::Free,
            status: AppStatus::Created,
            repo_name: None,
            logs: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 更新状态并刷新修改时间
    pub fn set_status(&mut self, status: AppStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// 用户记录
///
/// `token` 是源码托管平台授予的委托凭证，由外部 OAuth 流程获得
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// 源码托管平台上的用户名（仓库 owner）
    pub source_login: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub token: String,
}

impl User {
    pub fn new(source_login: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_login: source_login.into(),
            token: token.into(),
        }
    }

    /// 获取仓库访问凭证
    pub fn credential(&self) -> Option<Credential> {
        if self.token.is_empty() {
            None
        } else {
            Some(Credential::new(self.token.clone()))
        }
    }
}

/// 委托凭证
///
/// Debug 输出不包含令牌内容
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// 仓库引用（owner/repo）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// 仓库名只允许 `[A-Za-z0-9._-]`，且不能是 `.` / `..`
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name != "."
            && name != ".."
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }

    /// owner 即源码平台用户名：1-39 位字母数字或单个 `-`，首尾不能是 `-`
    pub fn is_valid_owner(login: &str) -> bool {
        (1..=39).contains(&login.len())
            && !login.starts_with('-')
            && !login.ends_with('-')
            && !login.contains("--")
            && login.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_application_defaults() {
        let app = Application::new("user-1", "blog");
        assert_eq!(app.status, AppStatus::Created);
        assert_eq!(app.plan, Plan::Free);
        assert!(app.repo_name.is_none());
        assert!(!app.id.is_empty());
    }

    #[test]
    fn test_credential_hidden_in_debug() {
        let user = User::new("octocat", "gho_secret");
        let cred = user.credential().unwrap();
        assert_eq!(cred.token(), "gho_secret");
        assert!(!format!("{:?}", cred).contains("gho_secret"));

        let anonymous = User::new("octocat", "");
        assert!(anonymous.credential().is_none());
    }

    #[test]
    fn test_repo_name_validation() {
        assert!(RepoRef::is_valid_name("hello-world"));
        assert!(RepoRef::is_valid_name("my_app.v2"));
        assert!(!RepoRef::is_valid_name(""));
        assert!(!RepoRef::is_valid_name(".."));
        assert!(!RepoRef::is_valid_name("a/b"));
        assert!(!RepoRef::is_valid_name("repo name"));
    }

    #[test]
    fn test_owner_validation() {
        assert!(RepoRef::is_valid_owner("octocat"));
        assert!(RepoRef::is_valid_owner("mona-lisa42"));
        assert!(!RepoRef::is_valid_owner(""));
        assert!(!RepoRef::is_valid_owner("../orgs"));
        assert!(!RepoRef::is_valid_owner("octocat/repos"));
        assert!(!RepoRef::is_valid_owner("-octocat"));
        assert!(!RepoRef::is_valid_owner("octo--cat"));
        assert!(!RepoRef::is_valid_owner("octo.cat"));
        assert!(!RepoRef::is_valid_owner(&"a".repeat(40)));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&AppStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
