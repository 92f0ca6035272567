//! 触发引擎错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("表达式错误: {0}")]
    Expression(String),

    #[error("条件错误: {0}")]
    Condition(String),

    #[error("动作执行失败: {action_type}: {message}")]
    ActionHandler {
        action_type: String,
        message: String,
    },

    #[error("未注册的动作类型: {0}")]
    UnknownActionType(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("持久化失败: {0}")]
    Persistence(String),

    #[error("JSON 序列化错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl TriggerError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Expression(_) => "EXPRESSION_ERROR",
            Self::Condition(_) => "CONDITION_ERROR",
            Self::ActionHandler { .. } => "ACTION_HANDLER_ERROR",
            Self::UnknownActionType(_) => "UNKNOWN_ACTION_TYPE",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TriggerError>;
