//! 表达式与模板插值
//!
//! 模板由普通文本与 `${ expr }` 片段交错组成。片段中的表达式先尝试按
//! 简单路径（`data.user.name`、`vars.items[0]`）直接读取，否则解析为语法树求值。
//!
//! 求值失败不会向外传播：记录告警后，`interpolate` 返回原文，`evaluate` 返回 null。

mod ast;
mod interpreter;
mod parser;
mod value;

pub use ast::{Accessor, BinaryOp, Expr, PathSegment, UnaryOp};
pub use parser::parse;
pub use value::{
    MISSING_TEXT, loose_eq, number_value, parse_numeric, safe_number, strict_eq, stringify,
    to_number, truthy, type_name,
};

use crate::context::TriggerContext;
use crate::error::Result;
use serde_json::Value;
use tracing::warn;

const SPAN_OPEN: &str = "${";

/// 模板片段
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Span(&'a str),
}

/// 拆分模板；未闭合的 `${` 按普通文本处理
fn split_template(template: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find(SPAN_OPEN) {
        let body_start = start + SPAN_OPEN.len();
        let Some(len) = span_length(&rest[body_start..]) else {
            break;
        };
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        segments.push(Segment::Span(&rest[body_start..body_start + len]));
        rest = &rest[body_start + len + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    segments
}

/// 查找与 `${` 匹配的 `}`，跳过字符串与嵌套花括号
fn span_length(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in body.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '{' => depth += 1,
            '}' if depth == 0 => return Some(i),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// 简单路径：上下文根名称加 `.name` / `[数字]` 段
fn parse_bare_path(expr: &str) -> Option<(&str, Vec<PathSegment>)> {
    let is_ident_start = |c: char| c.is_alphabetic() || c == '_' || c == '$';
    let is_ident = |c: char| c.is_alphanumeric() || c == '_' || c == '$';

    let expr = expr.trim();
    let root_end = expr.find(|c: char| !is_ident(c)).unwrap_or(expr.len());
    let root = &expr[..root_end];
    if !root.starts_with(is_ident_start) || !TriggerContext::is_root(root) {
        return None;
    }

    let mut segments = Vec::new();
    let mut rest = &expr[root_end..];
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(|c: char| !is_ident(c)).unwrap_or(after.len());
            let name = &after[..end];
            if !name.starts_with(is_ident_start) {
                return None;
            }
            segments.push(PathSegment::Key(name.to_string()));
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let end = after.find(']')?;
            let index = after[..end].parse::<usize>().ok()?;
            segments.push(PathSegment::Index(index));
            rest = &after[end + 1..];
        } else {
            return None;
        }
    }

    Some((root, segments))
}

/// 表达式求值器
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    /// 求值单个表达式（不含 `${}` 包裹），错误向上返回
    pub fn try_resolve(expr: &str, ctx: &TriggerContext) -> Result<Option<Value>> {
        if let Some((root, segments)) = parse_bare_path(expr) {
            return Ok(ctx.lookup(root, &segments));
        }
        let ast = parser::parse(expr)?;
        interpreter::eval(&ast, ctx)
    }

    /// 解析表达式或模板，缺失值返回 None
    ///
    /// 恰好是单个 `${}` 片段时保留原始类型；混合文本返回插值后的字符串。
    pub fn resolve(expr: &str, ctx: &TriggerContext) -> Option<Value> {
        if !expr.contains(SPAN_OPEN) {
            return Self::resolve_logged(expr, ctx);
        }

        match split_template(expr).as_slice() {
            [Segment::Span(body)] => Self::resolve_logged(body, ctx),
            _ => Some(Value::String(Self::interpolate(expr, ctx))),
        }
    }

    /// 求值表达式，缺失值与失败均返回 null
    ///
    /// 混合文本插值后若完全是数字则转为数值。
    pub fn evaluate(expr: &str, ctx: &TriggerContext) -> Value {
        if !expr.contains(SPAN_OPEN) {
            return Self::resolve_logged(expr, ctx).unwrap_or(Value::Null);
        }

        match split_template(expr).as_slice() {
            [Segment::Span(body)] => Self::resolve_logged(body, ctx).unwrap_or(Value::Null),
            _ => {
                let text = Self::interpolate(expr, ctx);
                match parse_numeric(&text) {
                    Some(n) => number_value(n),
                    None => Value::String(text),
                }
            }
        }
    }

    /// 模板插值
    pub fn interpolate(template: &str, ctx: &TriggerContext) -> String {
        if !template.contains(SPAN_OPEN) {
            return template.to_string();
        }

        let mut output = String::with_capacity(template.len());
        for segment in split_template(template) {
            match segment {
                Segment::Text(text) => output.push_str(text),
                Segment::Span(body) => match Self::try_resolve(body, ctx) {
                    Ok(value) => output.push_str(&stringify(&value)),
                    Err(e) => {
                        warn!(template = %template, error = %e, "模板插值失败，保留原文");
                        return template.to_string();
                    }
                },
            }
        }
        output
    }

    /// 深度插值：递归处理对象与数组中的字符串，其他标量原样保留
    ///
    /// 恰好是单个片段的字符串保留原始类型（缺失为 null）。
    pub fn interpolate_value(value: &Value, ctx: &TriggerContext) -> Value {
        match value {
            Value::String(s) if s.contains(SPAN_OPEN) => match split_template(s).as_slice() {
                [Segment::Span(body)] => Self::resolve_logged(body, ctx).unwrap_or(Value::Null),
                _ => Value::String(Self::interpolate(s, ctx)),
            },
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| Self::interpolate_value(item, ctx))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::interpolate_value(v, ctx)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_logged(expr: &str, ctx: &TriggerContext) -> Option<Value> {
        match Self::try_resolve(expr, ctx) {
            Ok(value) => value,
            Err(e) => {
                warn!(expression = %expr, error = %e, "表达式求值失败");
                None
            }
        }
    }
}
