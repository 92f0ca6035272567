//! 规则操作符定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 条件操作符
///
/// 同时接受名称（`GT`、`not_in`）与符号（`>`、`!=`）两种写法，大小写不敏感。
/// 无法识别的写法保留为 `Unknown`，由评估器记录告警并返回 false。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    // 通用比较
    Eq,
    Neq,

    // 数值比较
    Gt,
    Gte,
    Lt,
    Lte,
    Range,

    // 包含检查
    In,
    NotIn,
    Contains,

    // 字符串操作
    Matches,

    // 时间操作
    Since,
    After,
    Before,
    Until,

    Unknown(String),
}

impl Operator {
    /// 解析操作符写法
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "EQ" | "==" => Self::Eq,
            "NEQ" | "NE" | "!=" => Self::Neq,
            "GT" | ">" => Self::Gt,
            "GTE" | ">=" => Self::Gte,
            "LT" | "<" => Self::Lt,
            "LTE" | "<=" => Self::Lte,
            "RANGE" | "BETWEEN" => Self::Range,
            "IN" => Self::In,
            "NOT_IN" => Self::NotIn,
            "CONTAINS" => Self::Contains,
            "MATCHES" | "REGEX" => Self::Matches,
            "SINCE" => Self::Since,
            "AFTER" => Self::After,
            "BEFORE" => Self::Before,
            "UNTIL" => Self::Until,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl From<String> for Operator {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&str> for Operator {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.to_string()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "EQ",
            Self::Neq => "NEQ",
            Self::Gt => "GT",
            Self::Gte => "GTE",
            Self::Lt => "LT",
            Self::Lte => "LTE",
            Self::Range => "RANGE",
            Self::In => "IN",
            Self::NotIn => "NOT_IN",
            Self::Contains => "CONTAINS",
            Self::Matches => "MATCHES",
            Self::Since => "SINCE",
            Self::After => "AFTER",
            Self::Before => "BEFORE",
            Self::Until => "UNTIL",
            Self::Unknown(raw) => raw.as_str(),
        };
        write!(f, "{}", s)
    }
}

/// 逻辑操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    #[serde(alias = "and", alias = "&&")]
    And,
    #[serde(alias = "or", alias = "||")]
    Or,
}

impl fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names_and_symbols() {
        assert_eq!(Operator::parse("GT"), Operator::Gt);
        assert_eq!(Operator::parse(">"), Operator::Gt);
        assert_eq!(Operator::parse("gte"), Operator::Gte);
        assert_eq!(Operator::parse("!="), Operator::Neq);
        assert_eq!(Operator::parse("not_in"), Operator::NotIn);
        assert_eq!(Operator::parse("matches"), Operator::Matches);
    }

    #[test]
    fn test_unknown_operator_is_preserved() {
        let op = Operator::parse("SOUNDS_LIKE");
        assert_eq!(op, Operator::Unknown("SOUNDS_LIKE".to_string()));
        assert!(!op.is_known());
        assert_eq!(op.to_string(), "SOUNDS_LIKE");
    }

    #[test]
    fn test_serde_round_trip_through_string() {
        let op: Operator = serde_json::from_str("\"<=\"").unwrap();
        assert_eq!(op, Operator::Lte);
        assert_eq!(serde_json::to_string(&op).unwrap(), "\"LTE\"");
    }

    #[test]
    fn test_logical_operator_aliases() {
        let op: LogicalOperator = serde_json::from_str("\"or\"").unwrap();
        assert_eq!(op, LogicalOperator::Or);
        let op: LogicalOperator = serde_json::from_str("\"AND\"").unwrap();
        assert_eq!(op, LogicalOperator::And);
    }
}
