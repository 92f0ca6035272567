//! 动作执行器
//!
//! 执行单条规则的动作规格，产出按执行顺序排列的动作日志。
//!
//! 单个动作的处理顺序固定为：
//! 1. `if` 分支（命中后递归执行 `then`/`else`，跳过其余步骤）
//! 2. `break` 中止当前列表
//! 3. `continue` 跳过当前动作
//! 4. 按 `probability` 抽样跳过
//! 5. `delay` 延迟
//! 6. 深度插值 `params`
//! 7. 按 `type` 分发到内置动作或注册表

use crate::context::TriggerContext;
use crate::error::{Result, TriggerError};
use crate::evaluator::ConditionEvaluator;
use crate::expression::{ExpressionEvaluator, safe_number, stringify};
use crate::models::{Action, ActionSpec, ExecutedAction, ExecutionMode};
use crate::registry::ActionRegistry;
use crate::state::StateStore;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use trigger_shared::config::EngineConfig;
use trigger_shared::observability::metrics::record_action_execution;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 单个动作处理后的流程控制
enum Step {
    /// 继续下一个动作，附带处理器结果（如有）
    Next(Option<Value>),
    /// 中止当前列表
    Break,
}

/// 内置动作类型
pub mod builtin {
    pub const STATE_SET: &str = "STATE_SET";
    pub const STATE_GET: &str = "STATE_GET";
    pub const STATE_INCREMENT: &str = "STATE_INCREMENT";
    pub const STATE_DECREMENT: &str = "STATE_DECREMENT";
    pub const STATE_DELETE: &str = "STATE_DELETE";
    pub const EMIT_EVENT: &str = "EMIT_EVENT";

    pub fn is_builtin(action_type: &str) -> bool {
        matches!(
            action_type,
            STATE_SET | STATE_GET | STATE_INCREMENT | STATE_DECREMENT | STATE_DELETE | EMIT_EVENT
        )
    }
}

/// 动作执行器
pub struct ActionExecutor {
    state: StateStore,
    registry: ActionRegistry,
    conditions: Arc<ConditionEvaluator>,
    strict_actions: bool,
    max_depth: usize,
    rng: Mutex<StdRng>,
}

impl ActionExecutor {
    pub fn new(
        state: StateStore,
        registry: ActionRegistry,
        conditions: Arc<ConditionEvaluator>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            state,
            registry,
            conditions,
            strict_actions: config.strict_actions,
            max_depth: config.max_depth,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// 使用固定种子，抽样结果可复现
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// 执行动作规格
    ///
    /// 顶层的结构错误（空动作组、嵌套过深）以 Err 返回；
    /// 处理器失败记录在对应的动作日志中。
    #[instrument(skip(self, spec, ctx), fields(event = %ctx.event))]
    pub async fn run(
        &self,
        spec: &ActionSpec,
        ctx: &mut TriggerContext,
    ) -> Result<Vec<ExecutedAction>> {
        let mut log = Vec::new();
        self.run_spec(spec, ctx, 0, &mut log).await?;
        Ok(log)
    }

    fn run_spec<'a>(
        &'a self,
        spec: &'a ActionSpec,
        ctx: &'a mut TriggerContext,
        depth: usize,
        log: &'a mut Vec<ExecutedAction>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if depth > self.max_depth {
                return Err(TriggerError::Configuration(format!(
                    "动作嵌套超过最大深度 {}",
                    self.max_depth
                )));
            }

            let (mode, actions) = spec.normalize();
            if actions.is_empty() {
                return Err(TriggerError::Configuration("动作组为空".to_string()));
            }

            match mode {
                ExecutionMode::All => {
                    self.run_list(actions, ctx, depth, log, false).await;
                }
                ExecutionMode::Sequence => {
                    // lastResult 只在组内可见，结束后恢复
                    let saved = ctx.last_result.clone();
                    self.run_list(actions, ctx, depth, log, true).await;
                    ctx.last_result = saved;
                }
                ExecutionMode::Either => {
                    let chosen = self.pick_weighted(actions, ctx);
                    debug!(index = chosen, total = actions.len(), "EITHER 选中动作");
                    self.run_action(&actions[chosen], ctx, depth, log, true).await;
                }
            }
            Ok(())
        })
    }

    async fn run_list(
        &self,
        actions: &[Action],
        ctx: &mut TriggerContext,
        depth: usize,
        log: &mut Vec<ExecutedAction>,
        sequence: bool,
    ) {
        for action in actions {
            match self.run_action(action, ctx, depth, log, false).await {
                Step::Break => break,
                Step::Next(Some(result)) if sequence => ctx.last_result = Some(result),
                Step::Next(_) => {}
            }
        }
    }

    /// 处理单个动作；`weighted` 表示已由 EITHER 抽中，不再按概率跳过
    async fn run_action(
        &self,
        action: &Action,
        ctx: &mut TriggerContext,
        depth: usize,
        log: &mut Vec<ExecutedAction>,
        weighted: bool,
    ) -> Step {
        // 1. 条件分支
        if let Some(condition) = &action.condition {
            let matched = self.conditions.evaluate(condition, ctx);
            let branch = if matched {
                action.then.as_deref()
            } else {
                action.otherwise.as_deref()
            };
            if let Some(branch) = branch {
                let outcome = self.run_spec(branch, ctx, depth + 1, log).await;
                if let Err(e) = outcome {
                    warn!(error = %e, "分支动作执行失败");
                    log.push(ExecutedAction::failure(Self::label(action), e.to_string()));
                }
            }
            return Step::Next(None);
        }

        // 2. break
        if action.halt {
            log.push(ExecutedAction::success("BREAK", Value::Null));
            return Step::Break;
        }

        // 3. continue
        if action.skip {
            log.push(ExecutedAction::success("CONTINUE", Value::Null));
            return Step::Next(None);
        }

        let Some(action_type) = action.normalized_type() else {
            log.push(ExecutedAction::failure(
                Self::label(action),
                TriggerError::Configuration("动作缺少 type".to_string()).to_string(),
            ));
            return Step::Next(None);
        };
        let label = Self::label(action);

        // 4. 概率
        if !weighted
            && let Some(probability) = &action.probability
            && let Some(p) = Self::resolve_number(probability, ctx)
        {
            let draw = self.draw();
            if draw > p {
                debug!(action_type = %label, probability = p, draw, "动作按概率跳过");
                record_action_execution(&action_type, "skipped");
                log.push(ExecutedAction::success(label, json!({ "skipped": true })));
                return Step::Next(None);
            }
        }

        // 5. 延迟
        if let Some(delay) = &action.delay
            && let Some(ms) = Self::resolve_number(delay, ctx)
            && ms > 0.0
        {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        }

        // 6. 参数插值
        let raw = Value::Object(action.params.clone());
        let params = match ExpressionEvaluator::interpolate_value(&raw, ctx) {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        // 7. 分发
        match self.dispatch(&action_type, &params, ctx).await {
            Ok(result) => {
                record_action_execution(&action_type, "success");
                log.push(ExecutedAction::success(label, result.clone()));
                Step::Next(Some(result))
            }
            Err(e) => {
                warn!(action_type = %label, error = %e, "动作执行失败");
                record_action_execution(&action_type, "error");
                log.push(ExecutedAction::failure(label, e.to_string()));
                Step::Next(None)
            }
        }
    }

    async fn dispatch(
        &self,
        action_type: &str,
        params: &Map<String, Value>,
        ctx: &mut TriggerContext,
    ) -> Result<Value> {
        if builtin::is_builtin(action_type) {
            return self.run_builtin(action_type, params, ctx).await;
        }

        match self.registry.get(action_type) {
            Some(handler) => handler
                .handle(params, ctx)
                .await
                .map_err(|e| TriggerError::ActionHandler {
                    action_type: action_type.to_string(),
                    message: format!("{:#}", e),
                }),
            None if self.strict_actions => {
                Err(TriggerError::UnknownActionType(action_type.to_string()))
            }
            None => {
                warn!(action_type = %action_type, "未注册的动作类型，按已执行处理");
                Ok(json!({ "status": "executed" }))
            }
        }
    }

    async fn run_builtin(
        &self,
        action_type: &str,
        params: &Map<String, Value>,
        ctx: &mut TriggerContext,
    ) -> Result<Value> {
        let state_error = |e: TriggerError| TriggerError::ActionHandler {
            action_type: action_type.to_string(),
            message: e.to_string(),
        };

        match action_type {
            builtin::STATE_SET => {
                let key = Self::key_param(action_type, params)?;
                let value = params.get("value").cloned().unwrap_or(Value::Null);
                match params.get("ttl").and_then(|ttl| safe_number(&Some(ttl.clone()))) {
                    Some(ttl) if ttl > 0.0 => self
                        .state
                        .set_with_ttl(&key, value.clone(), Duration::from_millis(ttl as u64))
                        .await
                        .map_err(state_error)?,
                    _ => self.state.set(&key, value.clone()).await.map_err(state_error)?,
                }
                Ok(json!({ "key": key, "value": value }))
            }
            builtin::STATE_GET => {
                let key = Self::key_param(action_type, params)?;
                let alias = params
                    .get("as")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| key.clone());
                let value = self.state.get(&key).unwrap_or(Value::Null);
                ctx.env.insert(alias, value.clone());
                Ok(value)
            }
            builtin::STATE_INCREMENT | builtin::STATE_DECREMENT => {
                let key = Self::key_param(action_type, params)?;
                let amount = params
                    .get("amount")
                    .and_then(|a| safe_number(&Some(a.clone())))
                    .unwrap_or(1.0);
                let updated = if action_type == builtin::STATE_INCREMENT {
                    self.state.increment(&key, amount).await
                } else {
                    self.state.decrement(&key, amount).await
                };
                updated.map_err(state_error)
            }
            builtin::STATE_DELETE => {
                let key = Self::key_param(action_type, params)?;
                let deleted = self.state.delete(&key).await.map_err(state_error)?;
                Ok(json!({ "key": key, "deleted": deleted }))
            }
            builtin::EMIT_EVENT => {
                let event = params.get("event").cloned().unwrap_or(Value::Null);
                if !event.is_string() {
                    return Err(TriggerError::ActionHandler {
                        action_type: action_type.to_string(),
                        message: "缺少参数 event".to_string(),
                    });
                }
                let data = params.get("data").cloned().unwrap_or(Value::Null);
                Ok(json!({ "type": builtin::EMIT_EVENT, "event": event, "data": data }))
            }
            other => Err(TriggerError::UnknownActionType(other.to_string())),
        }
    }

    /// 读取 `key` 参数，数值键转为字符串
    fn key_param(action_type: &str, params: &Map<String, Value>) -> Result<String> {
        match params.get("key") {
            Some(Value::String(key)) if !key.is_empty() => Ok(key.clone()),
            Some(value @ Value::Number(_)) => Ok(stringify(&Some(value.clone()))),
            _ => Err(TriggerError::ActionHandler {
                action_type: action_type.to_string(),
                message: "缺少参数 key".to_string(),
            }),
        }
    }

    /// 按权重抽取一个动作，抽样落在边界外时取最后一个
    fn pick_weighted(&self, actions: &[Action], ctx: &TriggerContext) -> usize {
        let weights: Vec<f64> = actions
            .iter()
            .map(|action| {
                action
                    .probability
                    .as_ref()
                    .and_then(|p| Self::resolve_number(p, ctx))
                    .filter(|w| *w >= 0.0)
                    .unwrap_or(1.0)
            })
            .collect();

        let last = actions.len() - 1;
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return last;
        }

        let target = self.draw() * total;
        let mut cumulative = 0.0;
        for (index, weight) in weights.iter().enumerate() {
            cumulative += weight;
            if target < cumulative {
                return index;
            }
        }
        last
    }

    /// [0, 1) 均匀分布抽样
    fn draw(&self) -> f64 {
        self.rng.lock().random::<f64>()
    }

    /// 解析数值或表达式
    fn resolve_number(value: &Value, ctx: &TriggerContext) -> Option<f64> {
        let resolved = match value {
            Value::String(expr) => ExpressionEvaluator::evaluate(expr, ctx),
            other => other.clone(),
        };
        let number = safe_number(&Some(resolved));
        if number.is_none() {
            warn!(value = %value, "无法解析为数值，忽略");
        }
        number
    }

    fn label(action: &Action) -> String {
        match &action.action_type {
            Some(t) => t.trim().to_string(),
            None if action.condition.is_some() => "IF".to_string(),
            None => "UNKNOWN".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionGroup, Condition};
    use crate::registry::MockActionHandler;

    fn executor() -> ActionExecutor {
        let registry = ActionRegistry::new();
        registry.register_fn("calc", |params, ctx| async move {
            let op = params.get("op").and_then(Value::as_str).unwrap_or("0").to_string();
            Ok(ExpressionEvaluator::evaluate(&op, &ctx))
        });
        registry.register_fn("echo", |params, _| async move { Ok(Value::Object(params)) });
        registry.register_fn("fail", |_, _| async move { anyhow::bail!("boom") });

        ActionExecutor::new(
            StateStore::new(),
            registry,
            Arc::new(ConditionEvaluator::default()),
            &EngineConfig::default(),
        )
        .with_seed(7)
    }

    fn ctx() -> TriggerContext {
        TriggerContext::new("order.created", json!({ "amount": 150, "user": "alice" }))
            .with_var("limit", 100)
    }

    fn types(log: &[ExecutedAction]) -> Vec<&str> {
        log.iter().map(|e| e.action_type.as_str()).collect()
    }

    #[tokio::test]
    async fn test_all_mode_runs_every_action_independently() {
        let exec = executor();
        let spec = ActionSpec::from(vec![
            Action::new("echo").with_param("msg", "hi ${data.user}"),
            Action::new("fail"),
            Action::new("echo").with_param("n", "${data.amount}"),
        ]);

        let log = exec.run(&spec, &mut ctx()).await.unwrap();
        assert_eq!(types(&log), vec!["echo", "fail", "echo"]);
        assert_eq!(log[0].result, Some(json!({ "msg": "hi alice" })));
        assert!(log[1].error.as_deref().unwrap().contains("boom"));
        assert_eq!(log[2].result, Some(json!({ "n": 150 })));
    }

    #[tokio::test]
    async fn test_sequence_passes_last_result() {
        let exec = executor();
        let spec = ActionSpec::from(ActionGroup::new(
            ExecutionMode::Sequence,
            vec![
                Action::new("calc").with_param("op", "10+5"),
                Action::new("calc").with_param("op", "${lastResult}*2"),
            ],
        ));

        let mut ctx = ctx();
        let log = exec.run(&spec, &mut ctx).await.unwrap();
        let results: Vec<_> = log.iter().map(|e| e.result.clone().unwrap()).collect();

        assert_eq!(results, vec![json!(15), json!(30)]);
        // 组结束后恢复
        assert_eq!(ctx.last_result, None);
    }

    #[tokio::test]
    async fn test_either_logs_exactly_one_action() {
        let exec = executor();
        let spec = ActionSpec::from(ActionGroup::new(
            ExecutionMode::Either,
            vec![
                Action::new("a").with_probability(0.7),
                Action::new("b").with_probability(0.3),
            ],
        ));

        let mut counts = [0usize; 2];
        for _ in 0..2_000 {
            let log = exec.run(&spec, &mut ctx()).await.unwrap();
            assert_eq!(log.len(), 1);
            assert_eq!(log[0].result, Some(json!({ "status": "executed" })));
            match log[0].action_type.as_str() {
                "a" => counts[0] += 1,
                "b" => counts[1] += 1,
                other => panic!("unexpected action {}", other),
            }
        }

        let ratio = counts[0] as f64 / 2_000.0;
        assert!((0.64..0.76).contains(&ratio), "ratio = {}", ratio);
    }

    #[tokio::test]
    async fn test_either_zero_weights_falls_back_to_last() {
        let exec = executor();
        let spec = ActionSpec::from(ActionGroup::new(
            ExecutionMode::Either,
            vec![
                Action::new("a").with_probability(0),
                Action::new("b").with_probability(0),
            ],
        ));

        let log = exec.run(&spec, &mut ctx()).await.unwrap();
        assert_eq!(types(&log), vec!["b"]);
    }

    #[tokio::test]
    async fn test_break_halts_current_list_only() {
        let exec = executor();
        let spec = ActionSpec::from(vec![
            Action::new("echo"),
            Action::branch(
                Condition::new("data.amount", "GT", 100).into(),
                vec![Action::new("inner"), Action::halt(), Action::new("unreached")],
                None,
            ),
            Action::new("outer"),
        ]);

        let log = exec.run(&spec, &mut ctx()).await.unwrap();
        assert_eq!(types(&log), vec!["echo", "inner", "BREAK", "outer"]);
    }

    #[tokio::test]
    async fn test_continue_and_else_branch() {
        let exec = executor();
        let spec = ActionSpec::from(vec![
            Action::skip(),
            Action::branch(
                Condition::new("data.amount", "LT", 100).into(),
                Action::new("small"),
                Some(Action::new("large").into()),
            ),
        ]);

        let log = exec.run(&spec, &mut ctx()).await.unwrap();
        assert_eq!(types(&log), vec!["CONTINUE", "large"]);
    }

    #[tokio::test]
    async fn test_probability_zero_skips() {
        let exec = executor();
        let spec = ActionSpec::from(Action::new("echo").with_probability("vars.limit - 100"));

        let log = exec.run(&spec, &mut ctx()).await.unwrap();
        assert_eq!(log[0].result, Some(json!({ "skipped": true })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_suspends_before_dispatch() {
        let exec = executor();
        let spec = ActionSpec::from(vec![
            Action::new("echo").with_delay(1_000),
            Action::new("echo").with_delay("vars.limit * 5"),
        ]);

        let start = tokio::time::Instant::now();
        let log = exec.run(&spec, &mut ctx()).await.unwrap();

        assert_eq!(log.len(), 2);
        assert!(start.elapsed() >= Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn test_state_builtins() {
        let exec = executor();
        let mut ctx = ctx();
        let spec = ActionSpec::from(vec![
            Action::new("state_set")
                .with_param("key", "last_user")
                .with_param("value", "${data.user}"),
            Action::new("STATE_INCREMENT").with_param("key", "orders"),
            Action::new("STATE_INCREMENT").with_param("key", "orders").with_param("amount", 4),
            Action::new("STATE_DECREMENT").with_param("key", "orders"),
            Action::new("STATE_GET").with_param("key", "orders").with_param("as", "count"),
            Action::new("echo").with_param("text", "count=${env.count}"),
            Action::new("STATE_DELETE").with_param("key", "last_user"),
        ]);

        let log = exec.run(&spec, &mut ctx).await.unwrap();
        assert_eq!(log[0].result, Some(json!({ "key": "last_user", "value": "alice" })));
        assert_eq!(log[1].result, Some(json!(1)));
        assert_eq!(log[2].result, Some(json!(5)));
        assert_eq!(log[3].result, Some(json!(4)));
        assert_eq!(log[4].result, Some(json!(4)));
        assert_eq!(log[5].result, Some(json!({ "text": "count=4" })));
        assert_eq!(log[6].result, Some(json!({ "key": "last_user", "deleted": true })));
        assert_eq!(ctx.env.get("count"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_emit_event_returns_instruction() {
        let exec = executor();
        let spec = ActionSpec::from(
            Action::new("EMIT_EVENT")
                .with_param("event", "order.flagged")
                .with_param("data", json!({ "amount": "${data.amount}" })),
        );

        let log = exec.run(&spec, &mut ctx()).await.unwrap();
        assert_eq!(
            log[0].result,
            Some(json!({
                "type": "EMIT_EVENT",
                "event": "order.flagged",
                "data": { "amount": 150 }
            }))
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_action_error() {
        let exec = executor();
        let log = exec
            .run(&ActionSpec::from(Action::new("STATE_SET")), &mut ctx())
            .await
            .unwrap();
        assert!(!log[0].is_success());
    }

    #[tokio::test]
    async fn test_strict_actions_rejects_unknown_type() {
        let config = EngineConfig {
            strict_actions: true,
            ..Default::default()
        };
        let exec = ActionExecutor::new(
            StateStore::new(),
            ActionRegistry::new(),
            Arc::new(ConditionEvaluator::default()),
            &config,
        );

        let log = exec
            .run(&ActionSpec::from(Action::new("send_sms")), &mut ctx())
            .await
            .unwrap();
        assert!(log[0].error.as_deref().unwrap().contains("send_sms".to_uppercase().as_str()));
    }

    #[tokio::test]
    async fn test_registered_mock_handler_receives_interpolated_params() {
        let mut mock = MockActionHandler::new();
        mock.expect_handle()
            .withf(|params, _| params.get("to") == Some(&json!("alice")))
            .times(1)
            .returning(|_, _| Ok(json!("sent")));

        let registry = ActionRegistry::new();
        registry.register("notify", Arc::new(mock));
        let exec = ActionExecutor::new(
            StateStore::new(),
            registry,
            Arc::new(ConditionEvaluator::default()),
            &EngineConfig::default(),
        );

        let spec = ActionSpec::from(Action::new("Notify").with_param("to", "${data.user}"));
        let log = exec.run(&spec, &mut ctx()).await.unwrap();
        assert_eq!(log[0].result, Some(json!("sent")));
    }

    #[tokio::test]
    async fn test_structural_errors() {
        let exec = executor();
        let empty = ActionSpec::from(Vec::<Action>::new());
        let err = exec.run(&empty, &mut ctx()).await.unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");

        let config = EngineConfig {
            max_depth: 2,
            ..Default::default()
        };
        let shallow = ActionExecutor::new(
            StateStore::new(),
            ActionRegistry::new(),
            Arc::new(ConditionEvaluator::default()),
            &config,
        );
        let always: crate::models::ConditionNode = Condition::new("data.amount", "GT", 0).into();
        let mut spec = ActionSpec::from(Action::new("leaf"));
        for _ in 0..5 {
            spec = ActionSpec::from(Action::branch(always.clone(), spec, None));
        }

        let log = shallow.run(&spec, &mut ctx()).await.unwrap();
        assert!(log.iter().any(|entry| !entry.is_success()));
        assert!(log.iter().all(|entry| entry.action_type != "leaf"));
    }
}
