//! 规则引擎（事件调度）
//!
//! 每个事件的处理流程：
//! 1. 将状态存储快照写入上下文
//! 2. 筛选启用且监听该事件的规则（已按优先级排序）
//! 3. 依次检查冷却、评估条件，命中后记录冷却时间并执行动作
//! 4. `evaluate_all = false` 时在第一条命中规则后停止
//!
//! 处理过程不会失败，所有错误都记录在返回的结果中。

use crate::context::{Helpers, TriggerContext};
use crate::evaluator::ConditionEvaluator;
use crate::events::{EngineEvent, EventBus};
use crate::executor::ActionExecutor;
use crate::models::{Rule, TriggerResult};
use crate::registry::{ActionHandler, ActionRegistry};
use crate::state::StateStore;
use crate::store::{RuleDiff, RuleStore};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use trigger_shared::config::EngineConfig;
use trigger_shared::observability::metrics::{record_event_processed, record_rule_evaluation};

/// 规则引擎
pub struct RuleEngine {
    rules: RuleStore,
    conditions: Arc<ConditionEvaluator>,
    executor: ActionExecutor,
    state: StateStore,
    registry: ActionRegistry,
    events: EventBus,
    helpers: Helpers,
    /// rule_id -> 上次开始执行动作的时间
    cooldowns: DashMap<String, Instant>,
    config: EngineConfig,
}

impl RuleEngine {
    pub fn builder() -> RuleEngineBuilder {
        RuleEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 处理单个事件，返回按执行顺序排列的触发结果
    #[instrument(skip(self, ctx), fields(event = %ctx.event))]
    pub async fn process_event(&self, mut ctx: TriggerContext) -> Vec<TriggerResult> {
        let started = Instant::now();

        // 状态快照：同一次处理中看到的是开始时的值
        ctx.state = self.state.get_all();
        ctx.helpers.extend_missing(&self.helpers);

        let snapshot = self.rules.snapshot();
        let candidates: Vec<&Rule> = snapshot
            .iter()
            .filter(|rule| rule.enabled && rule.on == ctx.event)
            .collect();

        self.events.publish(EngineEvent::EngineStart {
            event: ctx.event.clone(),
            candidates: candidates.len(),
            timestamp: Utc::now(),
        });

        let mut results = Vec::new();
        for rule in candidates {
            if self.in_cooldown(rule) {
                debug!(rule_id = %rule.id, "规则处于冷却期，跳过");
                continue;
            }

            let evaluation_started = Instant::now();
            let matched = self.conditions.matches(rule.condition.as_ref(), &ctx);
            record_rule_evaluation(matched, evaluation_started.elapsed().as_secs_f64());
            if !matched {
                continue;
            }

            // 命中后立即占用冷却窗口，并发的处理过程不会重复执行
            if !self.claim_cooldown(rule) {
                debug!(rule_id = %rule.id, "规则已被并发处理占用冷却，跳过");
                continue;
            }

            debug!(rule_id = %rule.id, "规则命中");
            self.events.publish(EngineEvent::RuleMatched {
                rule_id: rule.id.clone(),
                event: ctx.event.clone(),
                timestamp: Utc::now(),
            });

            let result = match self.executor.run(&rule.actions, &mut ctx).await {
                Ok(log) => TriggerResult::new(rule.id.clone(), log),
                Err(e) => TriggerResult::failed(rule.id.clone(), e.to_string()),
            };
            self.publish_action_events(&result);

            results.push(result);
            if !self.config.evaluate_all {
                break;
            }
        }

        let elapsed = started.elapsed();
        record_event_processed(&ctx.event, results.len(), elapsed.as_secs_f64());
        self.events.publish(EngineEvent::EngineDone {
            event: ctx.event.clone(),
            triggered: results.len(),
            duration_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        });

        results
    }

    /// 以事件名、数据与全局变量构造上下文并处理
    pub async fn process(
        &self,
        event: &str,
        data: Value,
        vars: Map<String, Value>,
    ) -> Vec<TriggerResult> {
        self.process_event(TriggerContext::new(event, data).with_vars(vars))
            .await
    }

    fn in_cooldown(&self, rule: &Rule) -> bool {
        let Some(cooldown_ms) = rule.cooldown else {
            return false;
        };
        self.cooldowns
            .get(&rule.id)
            .is_some_and(|last| last.elapsed() < Duration::from_millis(cooldown_ms))
    }

    /// 检查并记录冷却时间（同一把分片锁内完成），返回是否可以执行
    fn claim_cooldown(&self, rule: &Rule) -> bool {
        let Some(cooldown_ms) = rule.cooldown else {
            return true;
        };
        let now = Instant::now();
        match self.cooldowns.entry(rule.id.clone()) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) < Duration::from_millis(cooldown_ms) {
                    return false;
                }
                last.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    fn publish_action_events(&self, result: &TriggerResult) {
        for entry in &result.executed_actions {
            let event = match &entry.error {
                None => EngineEvent::ActionSuccess {
                    rule_id: result.rule_id.clone(),
                    action_type: entry.action_type.clone(),
                    result: entry.result.clone(),
                    timestamp: entry.timestamp,
                },
                Some(error) => EngineEvent::ActionError {
                    rule_id: result.rule_id.clone(),
                    action_type: entry.action_type.clone(),
                    error: error.clone(),
                    timestamp: entry.timestamp,
                },
            };
            self.events.publish(event);
        }
    }

    /// 整体替换规则集
    ///
    /// 每个新增 id 发布一次 `RuleAdded`，每个移除 id 发布一次 `RuleRemoved`，
    /// 最后发布一次 `RulesUpdated`。
    #[instrument(skip(self, rules), fields(count = rules.len()))]
    pub fn update_rules(&self, rules: Vec<Rule>) -> RuleDiff {
        let diff = self.rules.replace_all(rules);
        let now = Utc::now();

        for id in &diff.added {
            self.events.publish(EngineEvent::RuleAdded {
                rule_id: id.clone(),
                timestamp: now,
            });
        }
        for id in &diff.removed {
            self.cooldowns.remove(id);
            self.events.publish(EngineEvent::RuleRemoved {
                rule_id: id.clone(),
                timestamp: now,
            });
        }
        self.events.publish(EngineEvent::RulesUpdated {
            before: diff.before,
            after: diff.after,
            timestamp: now,
        });

        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            total = diff.after,
            "规则集已更新"
        );
        diff
    }

    /// 当前规则（已按优先级排序）
    pub fn get_rules(&self) -> Vec<Rule> {
        self.rules.snapshot().as_ref().clone()
    }

    pub fn register_action(&self, action_type: &str, handler: Arc<dyn ActionHandler>) {
        self.registry.register(action_type, handler);
    }

    pub fn register_fn<F, Fut>(&self, action_type: &str, function: F)
    where
        F: Fn(Map<String, Value>, TriggerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.registry.register_fn(action_type, function);
    }

    /// 订阅生命周期通知
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// 清除某条规则的冷却记录
    pub fn reset_cooldown(&self, rule_id: &str) -> bool {
        self.cooldowns.remove(rule_id).is_some()
    }
}

/// 规则引擎构造器
#[derive(Default)]
pub struct RuleEngineBuilder {
    rules: Vec<Rule>,
    state: Option<StateStore>,
    registry: Option<ActionRegistry>,
    config: EngineConfig,
    helpers: Helpers,
    seed: Option<u64>,
}

impl RuleEngineBuilder {
    pub fn rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn state(mut self, state: StateStore) -> Self {
        self.state = Some(state);
        self
    }

    pub fn registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// 注册对所有事件可见的辅助函数
    pub fn helper<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.helpers.insert(name, Arc::new(function));
        self
    }

    /// 固定随机种子（EITHER 与 probability 抽样可复现）
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> RuleEngine {
        let state = self.state.unwrap_or_default();
        let registry = self.registry.unwrap_or_default();
        let conditions = Arc::new(ConditionEvaluator::new(self.config.max_depth));

        let mut executor = ActionExecutor::new(
            state.clone(),
            registry.clone(),
            Arc::clone(&conditions),
            &self.config,
        );
        if let Some(seed) = self.seed {
            executor = executor.with_seed(seed);
        }

        info!(
            rules = self.rules.len(),
            evaluate_all = self.config.evaluate_all,
            strict_actions = self.config.strict_actions,
            "规则引擎已创建"
        );

        RuleEngine {
            rules: RuleStore::from_rules(self.rules),
            conditions,
            executor,
            state,
            registry,
            events: EventBus::new(self.config.event_channel_capacity),
            helpers: self.helpers,
            cooldowns: DashMap::new(),
            config: self.config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, Condition};
    use serde_json::json;

    fn rule(id: &str, on: &str) -> Rule {
        Rule::new(id, on, Action::new("log").into())
    }

    #[tokio::test]
    async fn test_filters_by_event_and_enabled() {
        let engine = RuleEngine::builder()
            .rules(vec![
                rule("a", "order.created"),
                rule("b", "order.paid"),
                rule("c", "order.created").disabled(),
            ])
            .build();

        let results = engine.process("order.created", json!({}), Map::new()).await;
        let ids: Vec<_> = results.iter().map(|r| r.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert!(results[0].success);
    }

    #[tokio::test]
    async fn test_evaluate_all_false_stops_after_first_match() {
        let engine = RuleEngine::builder()
            .rules(vec![
                rule("low", "tick").with_priority(1),
                rule("high", "tick").with_priority(10),
            ])
            .config(EngineConfig {
                evaluate_all: false,
                ..Default::default()
            })
            .build();

        let results = engine.process("tick", json!({}), Map::new()).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule_id, "high");
    }

    #[tokio::test]
    async fn test_condition_uses_vars() {
        let engine = RuleEngine::builder()
            .rules(vec![rule("big", "order").with_condition(
                Condition::new("data.amount", "GT", "${vars.limit}").into(),
            )])
            .build();

        let mut vars = Map::new();
        vars.insert("limit".to_string(), json!(100));

        assert_eq!(engine.process("order", json!({ "amount": 150 }), vars.clone()).await.len(), 1);
        assert!(engine.process("order", json!({ "amount": 50 }), vars).await.is_empty());
    }

    #[tokio::test]
    async fn test_engine_helpers_available_in_expressions() {
        let engine = RuleEngine::builder()
            .rules(vec![rule("h", "tick").with_condition(
                Condition::new("helpers.double(data.n)", "EQ", 8).into(),
            )])
            .helper("double", |args: &[Value]| {
                json!(args.first().and_then(Value::as_i64).unwrap_or(0) * 2)
            })
            .build();

        assert_eq!(engine.process("tick", json!({ "n": 4 }), Map::new()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_top_level_error_marks_result_failed() {
        let engine = RuleEngine::builder()
            .rules(vec![Rule::new("empty", "tick", Vec::<Action>::new().into())])
            .build();

        let results = engine.process("tick", json!({}), Map::new()).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].error.is_some());
    }

    #[test]
    fn test_get_rules_sorted_after_update() {
        let engine = RuleEngine::builder().build();
        let diff = engine.update_rules(vec![
            rule("a", "tick").with_priority(1),
            rule("b", "tick").with_priority(2),
        ]);
        assert_eq!(diff.added, vec!["a", "b"]);

        let ids: Vec<_> = engine.get_rules().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let results = tokio_test::block_on(engine.process("tick", json!({}), Map::new()));
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_update_rules_clears_removed_cooldowns() {
        let engine = RuleEngine::builder()
            .rules(vec![rule("a", "tick").with_cooldown(60_000)])
            .build();

        assert_eq!(engine.process("tick", json!({}), Map::new()).await.len(), 1);
        assert!(engine.process("tick", json!({}), Map::new()).await.is_empty());

        engine.update_rules(Vec::new());
        engine.update_rules(vec![rule("a", "tick").with_cooldown(60_000)]);
        assert_eq!(engine.process("tick", json!({}), Map::new()).await.len(), 1);
        assert!(engine.reset_cooldown("a"));
    }
}
