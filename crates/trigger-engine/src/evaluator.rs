//! 条件评估器
//!
//! 递归评估条件树，实现各操作符的比较语义。
//! 评估过程不会返回错误：无法比较、无法解析或未知操作符都视为不满足。

use crate::context::TriggerContext;
use crate::error::{Result, TriggerError};
use crate::expression::{ExpressionEvaluator, loose_eq, safe_number, strict_eq, stringify};
use crate::models::{Condition, ConditionGroup, ConditionNode};
use crate::operators::{LogicalOperator, Operator};
use chrono::{DateTime, NaiveDate};
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

const DEFAULT_MAX_DEPTH: usize = 32;

/// 正则缓存上限；模式可能来自事件数据，超出后不再缓存新模式
const MAX_CACHED_PATTERNS: usize = 256;

/// 条件评估器
pub struct ConditionEvaluator {
    max_depth: usize,
    /// 已编译的正则表达式
    regex_cache: DashMap<String, Regex>,
}

impl ConditionEvaluator {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            regex_cache: DashMap::new(),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// 评估可选条件，缺省视为满足
    pub fn matches(&self, condition: Option<&ConditionNode>, ctx: &TriggerContext) -> bool {
        condition.is_none_or(|node| self.evaluate(node, ctx))
    }

    /// 评估条件树
    pub fn evaluate(&self, node: &ConditionNode, ctx: &TriggerContext) -> bool {
        match self.evaluate_node(node, ctx, 0) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(error = %e, "条件评估失败，视为不满足");
                false
            }
        }
    }

    fn evaluate_node(
        &self,
        node: &ConditionNode,
        ctx: &TriggerContext,
        depth: usize,
    ) -> Result<bool> {
        if depth > self.max_depth {
            return Err(TriggerError::Condition(format!(
                "条件嵌套超过最大深度 {}",
                self.max_depth
            )));
        }

        match node {
            ConditionNode::Leaf(condition) => self.evaluate_condition(condition, ctx),
            ConditionNode::Group(group) => self.evaluate_group(group, ctx, depth),
            ConditionNode::All(children) => {
                // 数组为隐式 AND
                for child in children {
                    if !self.evaluate_node(child, ctx, depth + 1)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// 评估逻辑组节点（短路求值）
    fn evaluate_group(
        &self,
        group: &ConditionGroup,
        ctx: &TriggerContext,
        depth: usize,
    ) -> Result<bool> {
        match group.operator {
            LogicalOperator::And => {
                for child in &group.conditions {
                    if !self.evaluate_node(child, ctx, depth + 1)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            LogicalOperator::Or => {
                for child in &group.conditions {
                    if self.evaluate_node(child, ctx, depth + 1)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// 评估单个条件
    pub fn evaluate_condition(&self, condition: &Condition, ctx: &TriggerContext) -> Result<bool> {
        let field = ExpressionEvaluator::resolve(&condition.field, ctx);
        let expected = match &condition.value {
            Value::String(s) if s.contains("${") => ExpressionEvaluator::resolve(s, ctx),
            other => Some(other.clone()),
        };

        self.compare(&field, &condition.operator, &expected)
    }

    /// 按操作符比较字段值与期望值，`None` 表示缺失值
    pub fn compare(
        &self,
        field: &Option<Value>,
        operator: &Operator,
        expected: &Option<Value>,
    ) -> Result<bool> {
        let matched = match operator {
            Operator::Eq => loose_eq(field, expected),
            Operator::Neq => !loose_eq(field, expected),
            Operator::Gt => Self::numeric(field, expected, |a, b| a > b),
            Operator::Gte => Self::numeric(field, expected, |a, b| a >= b),
            Operator::Lt => Self::numeric(field, expected, |a, b| a < b),
            Operator::Lte => Self::numeric(field, expected, |a, b| a <= b),
            Operator::Range => Self::range(field, expected),
            Operator::In => Self::in_list(field, expected).unwrap_or(false),
            Operator::NotIn => Self::in_list(field, expected).is_some_and(|found| !found),
            Operator::Contains => Self::contains(field, expected),
            Operator::Matches => self.regex_match(field, expected)?,
            Operator::Since | Operator::After => Self::time_compare(field, expected, |a, b| a >= b),
            Operator::Before | Operator::Until => Self::time_compare(field, expected, |a, b| a < b),
            Operator::Unknown(raw) => {
                warn!(operator = %raw, "未知的条件操作符，视为不满足");
                false
            }
        };

        Ok(matched)
    }

    /// 数值比较，任意一侧无法安全转换为数值时不满足
    fn numeric<F>(field: &Option<Value>, expected: &Option<Value>, cmp: F) -> bool
    where
        F: Fn(f64, f64) -> bool,
    {
        match (safe_number(field), safe_number(expected)) {
            (Some(a), Some(b)) => cmp(a, b),
            _ => false,
        }
    }

    /// 范围比较，期望值应为 [min, max] 数组（闭区间）
    fn range(field: &Option<Value>, expected: &Option<Value>) -> bool {
        let Some(Value::Array(bounds)) = expected else {
            return false;
        };
        let [min, max] = bounds.as_slice() else {
            return false;
        };

        match (
            safe_number(field),
            safe_number(&Some(min.clone())),
            safe_number(&Some(max.clone())),
        ) {
            (Some(value), Some(min), Some(max)) => value >= min && value <= max,
            _ => false,
        }
    }

    /// 列表包含检查（严格相等），期望值不是数组时返回 None
    fn in_list(field: &Option<Value>, expected: &Option<Value>) -> Option<bool> {
        let Some(Value::Array(items)) = expected else {
            return None;
        };
        Some(
            items
                .iter()
                .any(|item| strict_eq(field, &Some(item.clone()))),
        )
    }

    /// 字符串子串或数组成员（宽松相等）检查
    fn contains(field: &Option<Value>, expected: &Option<Value>) -> bool {
        match field {
            Some(Value::String(s)) => match expected {
                Some(Value::String(needle)) => s.contains(needle.as_str()),
                Some(v @ (Value::Number(_) | Value::Bool(_))) => {
                    s.contains(stringify(&Some(v.clone())).as_str())
                }
                _ => false,
            },
            Some(Value::Array(items)) => items
                .iter()
                .any(|item| loose_eq(&Some(item.clone()), expected)),
            _ => false,
        }
    }

    /// 正则表达式匹配
    fn regex_match(&self, field: &Option<Value>, expected: &Option<Value>) -> Result<bool> {
        let text = match field {
            Some(Value::String(s)) => s.clone(),
            Some(v @ (Value::Number(_) | Value::Bool(_))) => stringify(&Some(v.clone())),
            _ => return Ok(false),
        };
        let Some(Value::String(pattern)) = expected else {
            return Ok(false);
        };

        if let Some(regex) = self.regex_cache.get(pattern) {
            return Ok(regex.is_match(&text));
        }

        let regex = Regex::new(pattern).map_err(|e| {
            TriggerError::Condition(format!("无效的正则表达式 '{}': {}", pattern, e))
        })?;
        let matched = regex.is_match(&text);
        if self.regex_cache.len() < MAX_CACHED_PATTERNS {
            self.regex_cache.insert(pattern.clone(), regex);
        }
        Ok(matched)
    }

    /// 时间比较，无法解析的时间视为不满足
    fn time_compare<F>(field: &Option<Value>, expected: &Option<Value>, cmp: F) -> bool
    where
        F: Fn(i64, i64) -> bool,
    {
        match (
            field.as_ref().and_then(parse_timestamp),
            expected.as_ref().and_then(parse_timestamp),
        ) {
            (Some(a), Some(b)) => cmp(a, b),
            _ => false,
        }
    }

    /// 已缓存的正则表达式数量
    pub fn cached_patterns(&self) -> usize {
        self.regex_cache.len()
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

/// 解析时间为毫秒时间戳：数值（毫秒）、RFC 3339 或 YYYY-MM-DD
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_f64().map(|ms| ms as i64),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return date
                    .and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc().timestamp_millis());
            }
            s.parse::<i64>().ok()
        }
        _ => None,
    }
}
