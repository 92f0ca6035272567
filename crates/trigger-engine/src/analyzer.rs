//! 规则依赖分析
//!
//! 离线检查规则之间通过 `EMIT_EVENT` 形成的触发链，找出循环依赖。
//! 只识别字面量事件名，`${...}` 形式的动态事件名在此不可见。

use crate::executor::builtin;
use crate::models::{Action, ActionSpec, Rule};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// 依赖边：`from` 发出的事件会触发 `to`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub event: String,
}

/// 分析结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyReport {
    pub edges: Vec<DependencyEdge>,
    /// 每个环以起点结束，如 `[A, B, A]`
    pub cycles: Vec<Vec<String>>,
}

impl DependencyReport {
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

/// 依赖分析器
pub struct DependencyAnalyzer<'a> {
    rules: &'a [Rule],
    /// 规则 id，按首次出现顺序
    nodes: Vec<&'a str>,
    edges: Vec<DependencyEdge>,
    adjacency: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> DependencyAnalyzer<'a> {
    pub fn new(rules: &'a [Rule]) -> Self {
        let mut analyzer = Self {
            rules,
            nodes: Vec::new(),
            edges: Vec::new(),
            adjacency: HashMap::new(),
        };
        analyzer.build();
        analyzer
    }

    /// 构建事件监听索引与依赖边
    fn build(&mut self) {
        let rules = self.rules;

        let mut listeners: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut seen = HashSet::new();
        for rule in rules {
            if seen.insert(rule.id.as_str()) {
                self.nodes.push(rule.id.as_str());
            }
            let ids = listeners.entry(rule.on.as_str()).or_default();
            if !ids.contains(&rule.id.as_str()) {
                ids.push(rule.id.as_str());
            }
        }

        let mut edge_set = HashSet::new();
        for rule in rules {
            let mut emitted = Vec::new();
            collect_emitted(&rule.actions, &mut emitted);

            for event in emitted {
                let Some(targets) = listeners.get(event) else {
                    continue;
                };
                for &target in targets {
                    if !edge_set.insert((rule.id.as_str(), target, event)) {
                        continue;
                    }
                    self.edges.push(DependencyEdge {
                        from: rule.id.clone(),
                        to: target.to_string(),
                        event: event.to_string(),
                    });
                    self.adjacency
                        .entry(rule.id.as_str())
                        .or_default()
                        .push(target);
                }
            }
        }

        for targets in self.adjacency.values_mut() {
            let mut unique = HashSet::new();
            targets.retain(|t| unique.insert(*t));
        }

        debug!(rules = rules.len(), edges = self.edges.len(), "依赖图已构建");
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// 深度优先搜索，返回所有回边形成的环
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path: Vec<&str> = Vec::new();
        let mut on_stack = HashSet::new();
        let mut cycles = Vec::new();

        for &node in &self.nodes {
            if !visited.contains(node) {
                self.visit(node, &mut visited, &mut path, &mut on_stack, &mut cycles);
            }
        }

        for cycle in &cycles {
            warn!(cycle = %cycle.join(" -> "), "检测到规则循环依赖");
        }
        cycles
    }

    fn visit(
        &self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(node);
        path.push(node);
        on_stack.insert(node);

        for &next in self.adjacency.get(node).into_iter().flatten() {
            if on_stack.contains(next) {
                if let Some(start) = path.iter().position(|id| *id == next) {
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|id| id.to_string()).collect();
                    cycle.push(next.to_string());
                    cycles.push(cycle);
                }
            } else if !visited.contains(next) {
                self.visit(next, visited, path, on_stack, cycles);
            }
        }

        on_stack.remove(node);
        path.pop();
    }

    pub fn analyze(&self) -> DependencyReport {
        DependencyReport {
            edges: self.edges.clone(),
            cycles: self.detect_cycles(),
        }
    }
}

/// 收集动作树中所有字面量 EMIT_EVENT 事件名（含 then/else 分支与嵌套组）
fn collect_emitted<'a>(spec: &'a ActionSpec, out: &mut Vec<&'a str>) {
    let (_, actions) = spec.normalize();
    for action in actions {
        collect_from_action(action, out);
    }
}

fn collect_from_action<'a>(action: &'a Action, out: &mut Vec<&'a str>) {
    if let Some(then) = &action.then {
        collect_emitted(then, out);
    }
    if let Some(otherwise) = &action.otherwise {
        collect_emitted(otherwise, out);
    }

    let is_emit = action
        .normalized_type()
        .is_some_and(|t| t == builtin::EMIT_EVENT);
    if !is_emit {
        return;
    }
    match action.params.get("event").and_then(|v| v.as_str()) {
        Some(event) if !event.contains("${") => out.push(event),
        Some(event) => debug!(event, "动态事件名，跳过依赖分析"),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionGroup, ExecutionMode};

    fn emit(event: &str) -> Action {
        Action::new("EMIT_EVENT").with_param("event", event)
    }

    #[test]
    fn test_self_loop() {
        let rules = vec![Rule::new("a", "ping", emit("ping").into())];
        let cycles = DependencyAnalyzer::new(&rules).detect_cycles();

        assert_eq!(cycles, vec![vec!["a".to_string(), "a".to_string()]]);
    }

    #[test]
    fn test_mutual_cycle_reported_once() {
        let rules = vec![
            Rule::new("a", "x", emit("y").into()),
            Rule::new("b", "y", emit("x").into()),
        ];
        let cycles = DependencyAnalyzer::new(&rules).detect_cycles();

        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0], vec!["a", "b", "a"]);
    }

    #[test]
    fn test_chain_without_cycle() {
        let rules = vec![
            Rule::new("a", "x", emit("y").into()),
            Rule::new("b", "y", emit("z").into()),
            Rule::new("c", "z", Action::new("log").into()),
        ];
        let report = DependencyAnalyzer::new(&rules).analyze();

        assert!(!report.has_cycles());
        assert_eq!(report.edges.len(), 2);
        assert_eq!(report.edges[0].from, "a");
        assert_eq!(report.edges[0].to, "b");
        assert_eq!(report.edges[0].event, "y");
    }

    #[test]
    fn test_scans_branches_and_groups() {
        let nested = ActionGroup::new(ExecutionMode::Sequence, vec![emit("x")]);
        let branch = Action::branch(
            crate::models::Condition::new("data.ok", "EQ", true).into(),
            Action::new("log"),
            Some(nested.into()),
        );
        let rules = vec![Rule::new("a", "x", branch.into())];

        let cycles = DependencyAnalyzer::new(&rules).detect_cycles();
        assert_eq!(cycles.len(), 1);
    }

    #[test]
    fn test_dynamic_event_is_ignored() {
        let rules = vec![Rule::new("a", "x", emit("${data.next}").into())];
        let report = DependencyAnalyzer::new(&rules).analyze();

        assert!(report.edges.is_empty());
        assert!(report.cycles.is_empty());
    }
}
