//! 规则存储
//!
//! 规则集整体替换：新规则集排序后通过 ArcSwap 原子发布，
//! 正在处理中的事件继续使用替换前的快照。

use crate::models::Rule;
use arc_swap::ArcSwap;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;

/// 规则集替换前后的差异
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub before: usize,
    pub after: usize,
}

/// 按优先级排序的规则集
pub struct RuleStore {
    rules: ArcSwap<Vec<Rule>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            rules: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn from_rules(rules: Vec<Rule>) -> Self {
        Self {
            rules: ArcSwap::from_pointee(Self::sorted(rules)),
        }
    }

    /// 稳定排序：优先级降序，同优先级保持输入顺序
    fn sorted(mut rules: Vec<Rule>) -> Vec<Rule> {
        rules.sort_by_key(|rule| Reverse(rule.priority));
        rules
    }

    /// 当前规则集快照
    pub fn snapshot(&self) -> Arc<Vec<Rule>> {
        self.rules.load_full()
    }

    /// 整体替换规则集，返回 id 差异
    pub fn replace_all(&self, rules: Vec<Rule>) -> RuleDiff {
        let next = Arc::new(Self::sorted(rules));
        let previous = self.rules.swap(Arc::clone(&next));

        let old_ids: HashSet<&str> = previous.iter().map(|r| r.id.as_str()).collect();
        let new_ids: HashSet<&str> = next.iter().map(|r| r.id.as_str()).collect();

        RuleDiff {
            added: unique_ids(&next, |id| !old_ids.contains(id)),
            removed: unique_ids(&previous, |id| !new_ids.contains(id)),
            before: previous.len(),
            after: next.len(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Rule> {
        self.rules.load().iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rules.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.load().is_empty()
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

/// 按出现顺序去重收集满足条件的 id
fn unique_ids(rules: &[Rule], keep: impl Fn(&str) -> bool) -> Vec<String> {
    let mut seen = HashSet::new();
    rules
        .iter()
        .map(|r| r.id.as_str())
        .filter(|id| keep(id) && seen.insert(*id))
        .map(str::to_string)
        .collect()
}
