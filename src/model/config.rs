use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::pricing::ModelPrice;

/// TokenWatch 应用配置
///
/// 启动时读取一次，之后只读
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Anthropic 上游地址（`/anthropic/*` 转发目标）
    #[serde(default = "default_anthropic_upstream")]
    pub anthropic_upstream: String,

    /// OpenAI 兼容上游地址（`/openai/*` 转发目标）
    #[serde(default = "default_openai_upstream")]
    pub openai_upstream: String,

    /// 建连超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// 整体请求超时（秒），流式响应同样受限
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// 用量数据库路径，支持 `~/` 前缀
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// 出站 HTTP 代理地址（可选）
    /// 支持格式: http://host:port, https://host:port, socks5://host:port
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,

    /// 统计 API 密钥（可选，配置后 `/api/*` 需要认证）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_api_key: Option<String>,

    /// 用于识别调用方应用的请求头
    #[serde(default = "default_source_app_header")]
    pub source_app_header: String,

    /// 模型价格覆盖（每百万 token，美元），与内置价格表合并
    #[serde(default)]
    pub pricing: HashMap<String, ModelPrice>,

    /// 配置文件路径（运行时元数据，不写入 JSON）
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8877
}

fn default_anthropic_upstream() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_openai_upstream() -> String {
    "https://api.z.ai".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_db_path() -> String {
    "~/.tokenwatch/usage.db".to_string()
}

fn default_source_app_header() -> String {
    "user-agent".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            anthropic_upstream: default_anthropic_upstream(),
            openai_upstream: default_openai_upstream(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            db_path: default_db_path(),
            proxy_url: None,
            admin_api_key: None,
            source_app_header: default_source_app_header(),
            pricing: HashMap::new(),
            config_path: None,
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// 从文件加载配置，随后叠加 `.env` / 环境变量覆盖
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
            serde_json::from_str::<Config>(&content)
                .with_context(|| format!("解析配置文件失败: {}", path.display()))?
        } else {
            // 配置文件不存在，使用默认配置
            Self::default()
        };
        config.config_path = Some(path.to_path_buf());

        // .env 不存在时静默忽略
        let _ = dotenvy::dotenv();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.normalize();
        Ok(config)
    }

    /// 获取配置文件路径（如果有）
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// 使用 `TOKENWATCH_*` 变量覆盖配置
    ///
    /// `lookup` 便于测试时注入变量
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("TOKENWATCH_PROXY_PORT") {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("TOKENWATCH_PROXY_PORT 不是有效端口: {}", port))?;
        }
        if let Some(path) = lookup("TOKENWATCH_DB_PATH") {
            self.db_path = path;
        }
        if let Some(url) = lookup("TOKENWATCH_ANTHROPIC_URL") {
            self.anthropic_upstream = url;
        }
        if let Some(url) = lookup("TOKENWATCH_OPENAI_URL") {
            self.openai_upstream = url;
        }
        Ok(())
    }

    /// 去掉上游地址末尾的 `/`，避免拼接出 `//`
    fn normalize(&mut self) {
        for url in [&mut self.anthropic_upstream, &mut self.openai_upstream] {
            let trimmed = url.trim().trim_end_matches('/').to_string();
            *url = trimmed;
        }
    }

    /// 展开 `~/` 后的数据库路径
    pub fn resolved_db_path(&self) -> PathBuf {
        match self.db_path.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(&self.db_path)),
            None => PathBuf::from(&self.db_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.port, 8877);
        assert_eq!(config.anthropic_upstream, "https://api.anthropic.com");
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.request_timeout_secs, 300);
        assert_eq!(config.source_app_header, "user-agent");
        assert!(config.pricing.is_empty());
    }

    #[test]
    fn test_camel_case_keys_and_pricing() {
        let json = r#"{
            "openaiUpstream": "http://localhost:9000/",
            "requestTimeoutSecs": 60,
            "pricing": {"my-model": {"input": 1.5, "output": 2.0}}
        }"#;
        let mut config: Config = serde_json::from_str(json).unwrap();
        config.normalize();
        assert_eq!(config.openai_upstream, "http://localhost:9000");
        assert_eq!(config.request_timeout_secs, 60);
        let price = config.pricing.get("my-model").unwrap();
        assert_eq!(price.input, 1.5);
        assert_eq!(price.output, 2.0);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_overrides(|key| match key {
                "TOKENWATCH_PROXY_PORT" => Some("9999".to_string()),
                "TOKENWATCH_ANTHROPIC_URL" => Some("http://127.0.0.1:1234".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.anthropic_upstream, "http://127.0.0.1:1234");
        assert_eq!(config.openai_upstream, "https://api.z.ai");
    }

    #[test]
    fn test_invalid_env_port_is_error() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(|key| {
            (key == "TOKENWATCH_PROXY_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.config_path(), Some(path.as_path()));
        assert!(!config.anthropic_upstream.ends_with('/'));
    }

    #[test]
    fn test_resolved_db_path_plain() {
        let config = Config {
            db_path: "/tmp/usage.db".to_string(),
            ..Config::default()
        };
        assert_eq!(config.resolved_db_path(), PathBuf::from("/tmp/usage.db"));
    }
}
