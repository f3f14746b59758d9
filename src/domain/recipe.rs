//! 构建配方（hostway.yml）解析
//!
//! 配方格式：
//!
//! ```yaml
//! language: python
//! commands:
//!   package: [requests]
//!   build:
//!     - pip install -r requirements.txt
//!   start:
//!     - python app.py
//! env:
//!   - PORT=8080
//! ```

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// 配方文件在仓库中的固定路径
pub const RECIPE_PATH: &str = "hostway.yml";

/// 环境变量赋值 (NAME=value)
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EnvAssignment {
    pub name: String,
    pub value: String,
}

impl EnvAssignment {
    /// 解析 `KEY=VALUE`，只按第一个 `=` 切分
    pub fn parse(raw: &str) -> Option<Self> {
        let (name, value) = raw.split_once('=')?;
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            value: value.to_string(),
        })
    }
}

impl std::fmt::Display for EnvAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// 解析后的构建规格，仅作用于单次部署尝试
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BuildSpecification {
    /// 运行时 / 语言标识
    pub runtime: String,
    /// 按声明顺序执行的构建命令
    pub build_commands: Vec<String>,
    /// 按声明顺序执行的启动命令
    pub start_commands: Vec<String>,
    /// 声明的依赖包
    pub packages: Vec<String>,
    pub env: Vec<EnvAssignment>,
}

#[derive(Debug, Deserialize)]
struct RawCommands {
    build: Vec<String>,
    start: Vec<String>,
    #[serde(default)]
    package: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawRecipe {
    language: String,
    commands: RawCommands,
    #[serde(default)]
    env: Vec<String>,
}

/// 命令渲染为一行 `RUN` / `CMD` 后不会吞并后续指令
///
/// 换行、行尾 `\` 续行和 `<<` heredoc 都会让 Dockerfile 把下一行并入当前指令
fn is_single_step(command: &str) -> bool {
    let command = command.trim();
    !command.contains(['\n', '\r']) && !command.ends_with('\\') && !command.contains("<<")
}

impl BuildSpecification {
    /// 从原始配方内容解析构建规格
    ///
    /// 不做任何 I/O；缺少必填字段或类型不符时返回 `MalformedRecipe`
    pub fn parse(raw: &[u8]) -> Result<Self, PipelineError> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| PipelineError::MalformedRecipe(format!("recipe is not UTF-8: {}", e)))?;

        let recipe: RawRecipe = serde_yaml::from_str(text)
            .map_err(|e| PipelineError::MalformedRecipe(e.to_string()))?;

        let runtime = recipe.language.trim().to_string();
        if runtime.is_empty() {
            return Err(PipelineError::MalformedRecipe(
                "language must not be empty".to_string(),
            ));
        }

        if recipe.commands.start.iter().all(|c| c.trim().is_empty()) {
            return Err(PipelineError::MalformedRecipe(
                "commands.start must contain at least one command".to_string(),
            ));
        }

        if let Some(cmd) = recipe
            .commands
            .build
            .iter()
            .chain(&recipe.commands.start)
            .find(|c| !is_single_step(c))
        {
            return Err(PipelineError::MalformedRecipe(format!(
                "command must be a single Dockerfile line (no line breaks, trailing '\\' or heredoc): '{}'",
                cmd.trim()
            )));
        }

        let env = recipe
            .env
            .iter()
            .map(|raw| {
                EnvAssignment::parse(raw).ok_or_else(|| {
                    PipelineError::MalformedRecipe(format!(
                        "invalid env entry '{}', expected KEY=VALUE",
                        raw
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            runtime,
            build_commands: recipe.commands.build,
            start_commands: recipe.commands.start,
            packages: recipe.commands.package,
            env,
        })
    }
}
