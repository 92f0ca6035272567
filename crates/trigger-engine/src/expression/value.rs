//! 值的类型转换与比较
//!
//! `Option<Value>` 中的 `None` 表示缺失值（undefined）。

use serde_json::{Number, Value};

/// 缺失值的字符串形式
pub const MISSING_TEXT: &str = "undefined";

/// JSON 安全整数上限 2^53
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// 将 f64 转回 JSON 数值：整数优先，非有限值为 null
pub fn number_value(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn truthy(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// 宽松数值转换（缺失值与无法解析的字符串为 NaN）
pub fn to_number(value: &Option<Value>) -> f64 {
    match value {
        None => f64::NAN,
        Some(Value::Null) => 0.0,
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => parse_numeric(s).unwrap_or_else(|| {
            if s.trim().is_empty() { 0.0 } else { f64::NAN }
        }),
        Some(Value::Array(items)) => match items.as_slice() {
            [] => 0.0,
            [single] => to_number(&Some(single.clone())),
            _ => f64::NAN,
        },
        Some(Value::Object(_)) => f64::NAN,
    }
}

/// 严格数值转换：null、缺失、空串、非数字字符串、数组与对象均不可比较
pub fn safe_number(value: &Option<Value>) -> Option<f64> {
    match value {
        Some(Value::Bool(b)) => Some(f64::from(u8::from(*b))),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => parse_numeric(s),
        _ => None,
    }
}

/// 解析十进制数字字符串（不接受 inf/NaN 等写法）
pub fn parse_numeric(text: &str) -> Option<f64> {
    let text = text.trim();
    let first = text.chars().next()?;
    if !(first.is_ascii_digit() || matches!(first, '-' | '+' | '.')) {
        return None;
    }
    if !text
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
    {
        return None;
    }
    text.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// 插值时的字符串形式
pub fn stringify(value: &Option<Value>) -> String {
    match value {
        None => MISSING_TEXT.to_string(),
        Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => format_number(n),
        Some(other) => other.to_string(),
    }
}

fn format_number(n: &Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER => {
            format!("{}", f as i64)
        }
        _ => n.to_string(),
    }
}

/// 数组参与宽松比较时的原始值形式
fn to_primitive_text(value: &Value) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => stringify(&Some(other.clone())),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
        other => stringify(&Some(other.clone())),
    }
}

/// 宽松相等（null 与缺失值相等；数字与字符串、布尔值按数值比较）
pub fn loose_eq(left: &Option<Value>, right: &Option<Value>) -> bool {
    use Value::*;

    let (l, r) = match (left, right) {
        (None | Some(Null), None | Some(Null)) => return true,
        (None | Some(Null), _) | (_, None | Some(Null)) => return false,
        (Some(l), Some(r)) => (l, r),
    };

    match (l, r) {
        (Number(a), Number(b)) => a.as_f64() == b.as_f64(),
        (String(a), String(b)) => a == b,
        (Bool(a), Bool(b)) => a == b,
        (Number(a), String(b)) | (String(b), Number(a)) => {
            a.as_f64() == Some(to_number(&Some(String(b.clone()))))
        }
        (Bool(b), other) | (other, Bool(b)) => {
            let as_number = number_value(f64::from(u8::from(*b)));
            loose_eq(&Some(as_number), &Some(other.clone()))
        }
        (Array(_) | Object(_), Array(_) | Object(_)) => l == r,
        (compound @ (Array(_) | Object(_)), primitive)
        | (primitive, compound @ (Array(_) | Object(_))) => {
            loose_eq(
                &Some(String(to_primitive_text(compound))),
                &Some(primitive.clone()),
            )
        }
        _ => false,
    }
}

/// 严格相等（类型必须一致，数值按大小比较）
pub fn strict_eq(left: &Option<Value>, right: &Option<Value>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(Value::Number(a)), Some(Value::Number(b))) => a.as_f64() == b.as_f64(),
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
