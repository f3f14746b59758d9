//! 白名单与运行时配置加载
//!
//! 未配置覆盖文件时使用内置默认值；覆盖文件格式：
//!
//! ```json
//! {
//!   "runtimes": { "python": "python:3.13" },
//!   "approved_packages": { "python": ["requests", "flask"] }
//! }
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::domain::policy::{PolicyCatalog, RuntimeRegistry};

/// 覆盖文件结构
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    /// 为空时使用内置运行时
    #[serde(default)]
    pub runtimes: Option<RuntimeRegistry>,
    /// 为空时使用内置白名单
    #[serde(default)]
    pub approved_packages: Option<PolicyCatalog>,
}

/// 加载运行时注册表与白名单
pub fn load_policy(path: Option<&Path>) -> anyhow::Result<(RuntimeRegistry, PolicyCatalog)> {
    let Some(path) = path else {
        return Ok((RuntimeRegistry::builtin(), PolicyCatalog::builtin()));
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file {}", path.display()))?;
    let file: PolicyFile = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse policy file {}", path.display()))?;

    let registry = file.runtimes.unwrap_or_else(RuntimeRegistry::builtin);
    let catalog = file.approved_packages.unwrap_or_else(PolicyCatalog::builtin);

    info!(
        path = %path.display(),
        runtimes = registry.runtimes().count(),
        "Loaded policy file"
    );

    Ok((registry, catalog))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_when_no_file() {
        let (registry, catalog) = load_policy(None).unwrap();
        assert_eq!(registry.base_image("ruby"), Some("ruby:3.3"));
        assert!(catalog.is_approved("go", "gin"));
    }

    #[test]
    fn test_partial_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(
            &path,
            r#"{"approved_packages": {"python": ["requests", "flask"]}}"#,
        )
        .unwrap();

        let (registry, catalog) = load_policy(Some(&path)).unwrap();
        assert_eq!(registry.base_image("python"), Some("python:3.13"));
        assert!(catalog.is_approved("python", "flask"));
        assert!(!catalog.is_approved("go", "gin"));
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_policy(Some(&path)).is_err());
        assert!(load_policy(Some(&dir.path().join("missing.json"))).is_err());
    }
}
