//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::observability::ObservabilityConfig;

/// 引擎调度配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 为 false 时，单个事件在第一条规则命中后即停止评估
    pub evaluate_all: bool,
    /// 为 true 时，未注册的动作类型记为失败；否则仅告警
    pub strict_actions: bool,
    /// 条件树与动作树的最大嵌套深度
    pub max_depth: usize,
    /// 生命周期通知广播通道容量
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluate_all: true,
            strict_actions: false,
            max_depth: 32,
            event_channel_capacity: 256,
        }
    }
}

/// 状态过期策略
///
/// `key` 以 `*` 结尾时按前缀匹配，否则精确匹配。
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LifecycleEntry {
    pub key: String,
    pub ttl_ms: u64,
}

impl LifecycleEntry {
    pub fn new(key: impl Into<String>, ttl_ms: u64) -> Self {
        Self {
            key: key.into(),
            ttl_ms,
        }
    }

    /// 判断状态键是否受此策略约束
    pub fn matches(&self, key: &str) -> bool {
        match self.key.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => self.key == key,
        }
    }
}

/// 状态存储配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub lifecycle: Vec<LifecycleEntry>,
    /// 配置后使用文件持久化，否则使用内存持久化
    pub file_path: Option<String>,
}

impl StateConfig {
    /// 查找第一条匹配该键的过期策略
    pub fn ttl_for(&self, key: &str) -> Option<u64> {
        self.lifecycle
            .iter()
            .find(|entry| entry.matches(key))
            .map(|entry| entry.ttl_ms)
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub engine: EngineConfig,
    pub state: StateConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 环境由 `TRIGGER_ENV` 指定（默认 development），
    /// 配置目录由 `CONFIG_DIR` 指定（默认 config）。
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("TRIGGER_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::load_from(Path::new(&config_dir), service_name, &env)
    }

    /// 从指定目录加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. {dir}/default.toml（默认配置）
    /// 2. {dir}/{environment}.toml（环境特定配置）
    /// 3. {dir}/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（TRIGGER_ 前缀，双下划线分隔层级，如 TRIGGER_ENGINE__STRICT_ACTIONS -> engine.strict_actions）
    pub fn load_from(
        config_dir: &Path,
        service_name: &str,
        environment: &str,
    ) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", environment)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", environment))).required(false),
            )
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            .add_source(
                Environment::with_prefix("TRIGGER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
