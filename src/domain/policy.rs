//! 运行时注册表与依赖白名单
//!
//! 校验是纯函数：必须在分配任何工作目录或容器资源之前执行

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::recipe::BuildSpecification;
use crate::error::PipelineError;

/// 运行时 → 基础镜像
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct RuntimeRegistry {
    images: BTreeMap<String, String>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置运行时
    pub fn builtin() -> Self {
        [
            ("python", "python:3.13"),
            ("javascript", "node:20"),
            ("typescript", "node:20"),
            ("ruby", "ruby:3.3"),
            ("go", "golang:1.22"),
            ("php", "php:8.2"),
        ]
        .into_iter()
        .fold(Self::new(), |registry, (runtime, image)| {
            registry.with(runtime, image)
        })
    }

    pub fn with(mut self, runtime: &str, image: &str) -> Self {
        self.images.insert(runtime.to_string(), image.to_string());
        self
    }

    /// 查询运行时对应的基础镜像
    pub fn base_image(&self, runtime: &str) -> Option<&str> {
        self.images.get(runtime).map(String::as_str)
    }

    pub fn runtimes(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }
}

/// 运行时 → 允许安装的依赖包集合
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct PolicyCatalog {
    approved: BTreeMap<String, BTreeSet<String>>,
}

impl PolicyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置白名单
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for (runtime, package) in [
            ("python", "requests"),
            ("javascript", "express"),
            ("ruby", "rails"),
            ("go", "gin"),
            ("php", "laravel"),
        ] {
            catalog.approve(runtime, package);
        }
        catalog
    }

    /// 批准一个依赖包
    pub fn approve(&mut self, runtime: &str, package: &str) {
        self.approved
            .entry(runtime.to_string())
            .or_default()
            .insert(package.to_string());
    }

    /// 替换某个运行时的完整白名单
    pub fn replace(&mut self, runtime: &str, packages: impl IntoIterator<Item = String>) {
        self.approved
            .insert(runtime.to_string(), packages.into_iter().collect());
    }

    pub fn is_approved(&self, runtime: &str, package: &str) -> bool {
        self.approved
            .get(runtime)
            .is_some_and(|set| set.contains(package))
    }

    /// 返回第一个不在白名单中的依赖包
    pub fn first_unapproved<'a>(&self, runtime: &str, packages: &'a [String]) -> Option<&'a str> {
        packages
            .iter()
            .find(|p| !self.is_approved(runtime, p))
            .map(String::as_str)
    }

    pub fn packages(&self, runtime: &str) -> Vec<String> {
        self.approved
            .get(runtime)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// 校验通过的构建规格，携带解析出的基础镜像
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedSpec {
    pub spec: BuildSpecification,
    pub base_image: String,
}

/// 校验构建规格
///
/// 1. 运行时必须有注册的基础镜像
/// 2. 每个依赖包都必须在该运行时的白名单中，任一不符即整体拒绝
pub fn validate(
    spec: BuildSpecification,
    registry: &RuntimeRegistry,
    catalog: &PolicyCatalog,
) -> Result<ValidatedSpec, PipelineError> {
    let base_image = registry
        .base_image(&spec.runtime)
        .ok_or_else(|| PipelineError::UnsupportedRuntime(spec.runtime.clone()))?
        .to_string();

    if let Some(package) = catalog.first_unapproved(&spec.runtime, &spec.packages) {
        return Err(PipelineError::UnapprovedDependency {
            runtime: spec.runtime.clone(),
            package: package.to_string(),
        });
    }

    Ok(ValidatedSpec { spec, base_image })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn spec(runtime: &str, packages: &[&str]) -> BuildSpecification {
        BuildSpecification {
            runtime: runtime.to_string(),
            build_commands: vec![],
            start_commands: vec!["run".to_string()],
            packages: packages.iter().map(|p| p.to_string()).collect(),
            env: vec![],
        }
    }

    #[test]
    fn test_approved_packages_pass() {
        let validated = validate(
            spec("python", &["requests"]),
            &RuntimeRegistry::builtin(),
            &PolicyCatalog::builtin(),
        )
        .unwrap();
        assert_eq!(validated.base_image, "python:3.13");
    }

    #[test]
    fn test_no_packages_pass() {
        let validated = validate(
            spec("typescript", &[]),
            &RuntimeRegistry::builtin(),
            &PolicyCatalog::builtin(),
        )
        .unwrap();
        assert_eq!(validated.base_image, "node:20");
    }

    #[test]
    fn test_unsupported_runtime() {
        let err = validate(
            spec("rust", &[]),
            &RuntimeRegistry::builtin(),
            &PolicyCatalog::builtin(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedRuntime);
    }

    #[test]
    fn test_runtime_checked_before_packages() {
        let err = validate(
            spec("rust", &["serde"]),
            &RuntimeRegistry::builtin(),
            &PolicyCatalog::builtin(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedRuntime);
    }

    #[test]
    fn test_single_unapproved_rejects_all() {
        let mut catalog = PolicyCatalog::builtin();
        for p in ["numpy", "pandas", "flask-cors"] {
            catalog.approve("python", p);
        }

        let err = validate(
            spec("python", &["requests", "numpy", "flask", "pandas", "django"]),
            &RuntimeRegistry::builtin(),
            &catalog,
        )
        .unwrap_err();

        match err {
            PipelineError::UnapprovedDependency { runtime, package } => {
                assert_eq!(runtime, "python");
                assert_eq!(package, "flask");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_allow_list_is_per_runtime() {
        // express 只对 javascript 开放
        let err = validate(
            spec("python", &["express"]),
            &RuntimeRegistry::builtin(),
            &PolicyCatalog::builtin(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnapprovedDependency);
    }

    #[test]
    fn test_catalog_replace_and_serde() {
        let mut catalog = PolicyCatalog::new();
        catalog.replace("go", vec!["gin".to_string(), "echo".to_string()]);
        assert!(catalog.is_approved("go", "echo"));
        assert_eq!(catalog.packages("go"), vec!["echo", "gin"]);

        let json = serde_json::to_value(&catalog).unwrap();
        assert_eq!(json["go"][0], "echo");
        let back: PolicyCatalog = serde_json::from_value(json).unwrap();
        assert_eq!(back, catalog);
    }
}
