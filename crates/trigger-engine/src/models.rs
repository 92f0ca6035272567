//! 触发引擎领域模型
//!
//! 规则文档的结构化表示：规则、条件树、动作树以及执行结果。
//! 条件与动作的几种文档形态（单个对象、数组、分组）都映射为枚举变体。

use crate::error::{Result, TriggerError};
use crate::operators::{LogicalOperator, Operator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_enabled() -> bool {
    true
}

/// 规则定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 优先级，数值越大越先执行
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 冷却时间（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// 监听的事件名
    pub on: String,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionNode>,
    #[serde(rename = "do", alias = "actions")]
    pub actions: ActionSpec,
}

impl Rule {
    pub fn new(id: impl Into<String>, on: impl Into<String>, actions: ActionSpec) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            priority: 0,
            enabled: true,
            cooldown: None,
            tags: Vec::new(),
            on: on.into(),
            condition: None,
            actions,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cooldown(mut self, cooldown_ms: u64) -> Self {
        self.cooldown = Some(cooldown_ms);
        self
    }

    pub fn with_condition(mut self, condition: ConditionNode) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// 从 JSON 字符串解析规则文档（单个规则或规则数组）
    pub fn from_json(json: &str) -> Result<Vec<Rule>> {
        let value: Value = serde_json::from_str(json)?;
        parse_rules(value)
    }
}

/// 解析规则文档：接受单个规则对象或规则数组
pub fn parse_rules(document: Value) -> Result<Vec<Rule>> {
    match document {
        Value::Array(_) => Ok(serde_json::from_value(document)?),
        Value::Object(_) => Ok(vec![serde_json::from_value(document)?]),
        other => Err(TriggerError::Configuration(format!(
            "规则文档必须是对象或数组，实际为 {}",
            crate::expression::type_name(&other)
        ))),
    }
}

// ==================== 条件树 ====================

/// 条件节点（逻辑组、单个条件或隐式 AND 数组）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Group(ConditionGroup),
    Leaf(Condition),
    All(Vec<ConditionNode>),
}

impl From<Condition> for ConditionNode {
    fn from(condition: Condition) -> Self {
        Self::Leaf(condition)
    }
}

impl From<ConditionGroup> for ConditionNode {
    fn from(group: ConditionGroup) -> Self {
        Self::Group(group)
    }
}

/// 条件节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// 字段表达式，可以是路径也可以是完整表达式
    pub field: String,
    pub operator: Operator,
    /// 比较值；包含 `${...}` 的字符串会先求值
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(
        field: impl Into<String>,
        operator: impl Into<Operator>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value: value.into(),
        }
    }
}

/// 逻辑组节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub operator: LogicalOperator,
    #[serde(alias = "children")]
    pub conditions: Vec<ConditionNode>,
}

impl ConditionGroup {
    pub fn new(operator: LogicalOperator, conditions: Vec<ConditionNode>) -> Self {
        Self {
            operator,
            conditions,
        }
    }

    pub fn and(conditions: Vec<ConditionNode>) -> Self {
        Self::new(LogicalOperator::And, conditions)
    }

    pub fn or(conditions: Vec<ConditionNode>) -> Self {
        Self::new(LogicalOperator::Or, conditions)
    }
}

// ==================== 动作树 ====================

/// 动作组执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionMode {
    #[serde(alias = "all")]
    All,
    #[serde(alias = "sequence")]
    Sequence,
    #[serde(alias = "either")]
    Either,
}

/// 动作规格（分组、数组或单个动作）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionSpec {
    Group(ActionGroup),
    List(Vec<Action>),
    Single(Action),
}

impl ActionSpec {
    /// 归一化为 (模式, 动作列表)：数组视为 ALL，单个动作视为只有一个元素的 ALL
    pub fn normalize(&self) -> (ExecutionMode, &[Action]) {
        match self {
            Self::Group(group) => (group.mode, group.actions.as_slice()),
            Self::List(actions) => (ExecutionMode::All, actions.as_slice()),
            Self::Single(action) => (ExecutionMode::All, std::slice::from_ref(action)),
        }
    }
}

impl From<Action> for ActionSpec {
    fn from(action: Action) -> Self {
        Self::Single(action)
    }
}

impl From<Vec<Action>> for ActionSpec {
    fn from(actions: Vec<Action>) -> Self {
        Self::List(actions)
    }
}

impl From<ActionGroup> for ActionSpec {
    fn from(group: ActionGroup) -> Self {
        Self::Group(group)
    }
}

/// 动作组
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionGroup {
    pub mode: ExecutionMode,
    pub actions: Vec<Action>,
}

impl ActionGroup {
    pub fn new(mode: ExecutionMode, actions: Vec<Action>) -> Self {
        Self { mode, actions }
    }
}

/// 动作
///
/// `type` 仅在纯控制流动作（`if`/`break`/`continue`）中可以省略。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    /// 延迟（毫秒），数值或表达式
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<Value>,
    /// 执行概率（0..1），数值或表达式
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<Value>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<Box<ActionSpec>>,
    #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<Box<ActionSpec>>,
    #[serde(rename = "break", default, skip_serializing_if = "std::ops::Not::not")]
    pub halt: bool,
    #[serde(rename = "continue", default, skip_serializing_if = "std::ops::Not::not")]
    pub skip: bool,
}

impl Action {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: Some(action_type.into()),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_delay(mut self, delay: impl Into<Value>) -> Self {
        self.delay = Some(delay.into());
        self
    }

    pub fn with_probability(mut self, probability: impl Into<Value>) -> Self {
        self.probability = Some(probability.into());
        self
    }

    /// 条件分支动作
    pub fn branch(
        condition: ConditionNode,
        then: impl Into<ActionSpec>,
        otherwise: Option<ActionSpec>,
    ) -> Self {
        Self {
            condition: Some(condition),
            then: Some(Box::new(then.into())),
            otherwise: otherwise.map(Box::new),
            ..Default::default()
        }
    }

    /// 中止当前列表的控制动作
    pub fn halt() -> Self {
        Self {
            halt: true,
            ..Default::default()
        }
    }

    /// 跳过当前动作的控制动作
    pub fn skip() -> Self {
        Self {
            skip: true,
            ..Default::default()
        }
    }

    /// 动作类型的规范写法（大写），用于大小写不敏感的分发
    pub fn normalized_type(&self) -> Option<String> {
        self.action_type
            .as_deref()
            .map(|t| t.trim().to_ascii_uppercase())
    }
}

// ==================== 执行结果 ====================

/// 动作执行日志
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutedAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutedAction {
    pub fn success(action_type: impl Into<String>, result: Value) -> Self {
        Self {
            action_type: action_type.into(),
            result: Some(result),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(action_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            result: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// 单条规则在一次事件处理中的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResult {
    pub rule_id: String,
    pub success: bool,
    pub executed_actions: Vec<ExecutedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TriggerResult {
    pub fn new(rule_id: impl Into<String>, executed_actions: Vec<ExecutedAction>) -> Self {
        let success = executed_actions.iter().all(ExecutedAction::is_success);
        Self {
            rule_id: rule_id.into(),
            success,
            executed_actions,
            error: None,
        }
    }

    /// 执行器自身失败（如嵌套过深）时的结果
    pub fn failed(rule_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            success: false,
            executed_actions: Vec::new(),
            error: Some(error.into()),
        }
    }
}
