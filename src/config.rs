//! 配置模块，负责加载JSON配置文件
//!
//! Compiler settings: physical table names, the parameter name prefix and
//! whether rendered SQL is re-indented.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置文件不存在: {0}")]
    NotFound(String),
    #[error("无法读取配置文件 {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("无法解析JSON配置文件 {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// 编译器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Merged calls table, keyed by (project_id, id)
    pub calls_table: String,
    /// LLM price table, keyed by llm_id
    pub price_table: String,
    /// Prefix for generated parameter names
    pub param_prefix: String,
    /// Re-indent rendered SQL for display
    pub pretty_sql: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            calls_table: "calls_merged".to_string(),
            price_table: "llm_token_prices".to_string(),
            param_prefix: "pb".to_string(),
            pretty_sql: false,
        }
    }
}

impl CompilerConfig {
    /// 从JSON文件加载配置，缺省字段使用默认值
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let display = path_ref.display().to_string();

        if !path_ref.exists() {
            return Err(ConfigError::NotFound(display));
        }

        let content = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }
}
