//! 事件上下文
//!
//! 一次事件处理过程中表达式可见的全部数据：事件数据、全局变量、
//! 状态快照、临时环境、宿主提供的辅助函数以及上一个动作的结果。

use crate::expression::PathSegment;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 宿主提供的辅助函数
pub type HelperFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// 辅助函数表（克隆开销很小）
#[derive(Clone, Default)]
pub struct Helpers {
    functions: Arc<HashMap<String, HelperFn>>,
}

impl Helpers {
    pub fn get(&self, name: &str) -> Option<&HelperFn> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, function: HelperFn) {
        Arc::make_mut(&mut self.functions).insert(name.into(), function);
    }

    /// 补充本表中不存在的同名函数
    pub fn extend_missing(&mut self, other: &Helpers) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other.clone();
            return;
        }
        for (name, function) in other.functions.iter() {
            if !self.contains(name) {
                self.insert(name.clone(), Arc::clone(function));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for Helpers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("Helpers").field("names", &names).finish()
    }
}

/// 触发上下文
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub vars: Map<String, Value>,
    /// 事件处理开始时的状态快照
    pub state: Map<String, Value>,
    /// 动作之间共享的临时数据（如 STATE_GET 的结果）
    pub env: Map<String, Value>,
    pub helpers: Helpers,
    /// 仅在 SEQUENCE 组内有意义
    pub last_result: Option<Value>,
}

impl TriggerContext {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            timestamp: Utc::now(),
            data,
            vars: Map::new(),
            state: Map::new(),
            env: Map::new(),
            helpers: Helpers::default(),
            last_result: None,
        }
    }

    pub fn with_vars(mut self, vars: Map<String, Value>) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with_state(mut self, state: Map<String, Value>) -> Self {
        self.state = state;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_helper<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.helpers.insert(name, Arc::new(function));
        self
    }

    /// 按根名称和路径段查找值，缺失时返回 None
    pub fn lookup(&self, root: &str, segments: &[PathSegment]) -> Option<Value> {
        match root {
            "data" => walk(&self.data, segments),
            "vars" | "globals" => walk_map(&self.vars, segments),
            "state" => walk_map(&self.state, segments),
            "env" => walk_map(&self.env, segments),
            "lastResult" => self.last_result.as_ref().and_then(|v| walk(v, segments)),
            "event" if segments.is_empty() => Some(Value::String(self.event.clone())),
            "timestamp" if segments.is_empty() => {
                Some(Value::from(self.timestamp.timestamp_millis()))
            }
            _ => None,
        }
    }

    /// 是否为可识别的上下文根名称
    pub fn is_root(name: &str) -> bool {
        matches!(
            name,
            "data"
                | "vars"
                | "globals"
                | "state"
                | "env"
                | "helpers"
                | "lastResult"
                | "event"
                | "timestamp"
        )
    }
}

fn walk_map(map: &Map<String, Value>, segments: &[PathSegment]) -> Option<Value> {
    match segments.split_first() {
        None => Some(Value::Object(map.clone())),
        Some((PathSegment::Key(key), rest)) => map.get(key).and_then(|v| walk(v, rest)),
        Some((PathSegment::Index(index), rest)) => {
            map.get(&index.to_string()).and_then(|v| walk(v, rest))
        }
    }
}

/// 沿路径段遍历 JSON 值
pub(crate) fn walk(value: &Value, segments: &[PathSegment]) -> Option<Value> {
    let mut current = value;
    for (i, segment) in segments.iter().enumerate() {
        current = match (current, segment) {
            (Value::Object(map), PathSegment::Key(key)) => map.get(key)?,
            (Value::Object(map), PathSegment::Index(index)) => map.get(&index.to_string())?,
            (Value::Array(items), PathSegment::Index(index)) => items.get(*index)?,
            (Value::Array(items), PathSegment::Key(key)) => {
                if key == "length" && i + 1 == segments.len() {
                    return Some(Value::from(items.len()));
                }
                let index: usize = key.parse().ok()?;
                items.get(index)?
            }
            (Value::String(s), PathSegment::Key(key))
                if key == "length" && i + 1 == segments.len() =>
            {
                return Some(Value::from(s.chars().count()));
            }
            _ => return None,
        };
    }
    Some(current.clone())
}
