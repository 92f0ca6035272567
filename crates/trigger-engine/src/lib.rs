//! 触发引擎
//!
//! 事件-条件-动作（ECA）自动化引擎，规则以数据形式声明：
//! - 监听事件名（`on`）
//! - 条件树（`if`），支持 AND/OR 嵌套与表达式字段
//! - 动作计划（`do`），支持 ALL/SEQUENCE/EITHER 分组、分支、延迟与概率
//!
//! 另外提供带 TTL 的持久化状态存储，以及规则间循环依赖的静态检测。

pub mod analyzer;
pub mod context;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod executor;
pub mod expression;
pub mod models;
pub mod operators;
pub mod registry;
pub mod state;
pub mod store;

pub use analyzer::{DependencyAnalyzer, DependencyEdge, DependencyReport};
pub use context::{HelperFn, Helpers, TriggerContext};
pub use engine::{RuleEngine, RuleEngineBuilder};
pub use error::{Result, TriggerError};
pub use evaluator::ConditionEvaluator;
pub use events::{EngineEvent, EventBus};
pub use executor::ActionExecutor;
pub use expression::ExpressionEvaluator;
pub use models::{
    Action, ActionGroup, ActionSpec, Condition, ConditionGroup, ConditionNode, ExecutedAction,
    ExecutionMode, Rule, TriggerResult, parse_rules,
};
pub use operators::{LogicalOperator, Operator};
pub use registry::{ActionHandler, ActionRegistry};
pub use state::{FilePersistence, MemoryPersistence, Persistence, StateHandle, StateStore};
pub use store::{RuleDiff, RuleStore};

pub use trigger_shared::config::{EngineConfig, LifecycleEntry, StateConfig};
