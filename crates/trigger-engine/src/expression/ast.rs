//! 表达式语法树

use serde_json::Value;

/// 已解析的路径段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// 成员访问：`.name` 或 `[expr]`
#[derive(Debug, Clone, PartialEq)]
pub enum Accessor {
    Field(String),
    Computed(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Lt,
    Lte,
    Gt,
    Gte,
    LooseEq,
    LooseNeq,
    StrictEq,
    StrictNeq,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Undefined,
    Array(Vec<Expr>),
    Path {
        root: String,
        accessors: Vec<Accessor>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
    /// `name(..)` 或 `namespace.name(..)`
    Call {
        namespace: Option<String>,
        name: String,
        args: Vec<Expr>,
    },
}
