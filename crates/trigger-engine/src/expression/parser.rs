//! 词法分析与递归下降解析
//!
//! 优先级（由低到高）：三元、`||`、`&&`、相等、关系、加减、乘除、一元、成员访问/调用。

use super::ast::{Accessor, BinaryOp, Expr, UnaryOp};
use crate::error::{Result, TriggerError};
use serde_json::Value;

/// 括号与一元运算的最大嵌套层数
const MAX_NESTING: usize = 64;

/// 单个表达式允许的语法树节点总数，同时限制左结合运算链的深度
const MAX_NODES: usize = 512;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

/// 多字符符号放在前面，保证最长匹配
const PUNCTUATION: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!", "?",
    ":", "(", ")", "[", "]", ",", ".",
];

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let number = text
                .parse::<f64>()
                .map_err(|_| TriggerError::Expression(format!("无效的数字: {}", text)))?;
            tokens.push(Token::Number(number));
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(TriggerError::Expression("字符串未闭合".to_string()));
                };
                i += 1;
                if ch == quote {
                    break;
                }
                if ch == '\\' {
                    let Some(&escaped) = chars.get(i) else {
                        return Err(TriggerError::Expression("字符串未闭合".to_string()));
                    };
                    i += 1;
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                } else {
                    text.push(ch);
                }
            }
            tokens.push(Token::Str(text));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
        match PUNCTUATION.iter().find(|p| rest.starts_with(**p)) {
            Some(&p) => {
                tokens.push(Token::Punct(p));
                i += p.chars().count();
            }
            None => {
                return Err(TriggerError::Expression(format!("无法识别的字符 '{}'", c)));
            }
        }
    }

    Ok(tokens)
}

/// 解析表达式为语法树
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(TriggerError::Expression("表达式为空".to_string()));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        nodes: 0,
    };
    let expr = parser.parse_conditional()?;

    if let Some(token) = parser.peek() {
        return Err(TriggerError::Expression(format!(
            "表达式末尾存在多余内容: {:?}",
            token
        )));
    }

    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    nodes: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(p)) if *p == punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> Result<()> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(TriggerError::Expression(format!(
                "期望 '{}'，实际为 {:?}",
                punct,
                self.peek()
            )))
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(TriggerError::Expression("表达式嵌套过深".to_string()));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// 记录一个新节点，超出总数上限时报错
    fn node(&mut self) -> Result<()> {
        self.nodes += 1;
        if self.nodes > MAX_NODES {
            return Err(TriggerError::Expression(format!(
                "表达式过长（超过 {} 个节点）",
                MAX_NODES
            )));
        }
        Ok(())
    }

    fn parse_conditional(&mut self) -> Result<Expr> {
        self.enter()?;
        let test = self.parse_or()?;
        let expr = if self.eat("?") {
            let consequent = self.parse_conditional()?;
            self.expect(":")?;
            let alternate = self.parse_conditional()?;
            Expr::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            }
        } else {
            test
        };
        self.leave();
        Ok(expr)
    }

    /// 左结合的二元运算层
    fn parse_binary(
        &mut self,
        operators: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut left = next(self)?;
        'outer: loop {
            for (symbol, op) in operators {
                if self.eat(symbol) {
                    self.node()?;
                    let right = next(self)?;
                    left = Expr::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        self.parse_binary(&[("||", BinaryOp::Or)], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        self.parse_binary(&[("&&", BinaryOp::And)], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        self.parse_binary(
            &[
                ("===", BinaryOp::StrictEq),
                ("!==", BinaryOp::StrictNeq),
                ("==", BinaryOp::LooseEq),
                ("!=", BinaryOp::LooseNeq),
            ],
            Self::parse_relational,
        )
    }

    fn parse_relational(&mut self) -> Result<Expr> {
        self.parse_binary(
            &[
                ("<=", BinaryOp::Lte),
                (">=", BinaryOp::Gte),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        self.parse_binary(
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            Self::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        self.parse_binary(
            &[
                ("*", BinaryOp::Mul),
                ("/", BinaryOp::Div),
                ("%", BinaryOp::Rem),
            ],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = if self.eat("!") {
            Some(UnaryOp::Not)
        } else if self.eat("-") {
            Some(UnaryOp::Neg)
        } else if self.eat("+") {
            Some(UnaryOp::Plus)
        } else {
            None
        };

        match op {
            Some(op) => {
                self.node()?;
                self.enter()?;
                let operand = self.parse_unary()?;
                self.leave();
                Ok(Expr::Unary {
                    op,
                    operand: Box::new(operand),
                })
            }
            None => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        self.node()?;
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(super::value::number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Punct("(")) => {
                let expr = self.parse_conditional()?;
                self.expect(")")?;
                Ok(expr)
            }
            Some(Token::Punct("[")) => {
                let items = self.parse_list("]")?;
                Ok(Expr::Array(items))
            }
            Some(Token::Ident(name)) => self.parse_identifier(name),
            other => Err(TriggerError::Expression(format!("意外的符号: {:?}", other))),
        }
    }

    fn parse_identifier(&mut self, name: String) -> Result<Expr> {
        match name.as_str() {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            "undefined" => return Ok(Expr::Undefined),
            _ => {}
        }

        let mut accessors = Vec::new();
        loop {
            if self.eat(".") {
                match self.next() {
                    Some(Token::Ident(field)) => accessors.push(Accessor::Field(field)),
                    other => {
                        return Err(TriggerError::Expression(format!(
                            "'.' 之后需要属性名，实际为 {:?}",
                            other
                        )));
                    }
                }
            } else if self.eat("[") {
                let index = self.parse_conditional()?;
                self.expect("]")?;
                accessors.push(Accessor::Computed(Box::new(index)));
            } else if self.eat("(") {
                let args = self.parse_list(")")?;
                return match (accessors.len(), accessors.pop()) {
                    (0, None) => Ok(Expr::Call {
                        namespace: None,
                        name,
                        args,
                    }),
                    (1, Some(Accessor::Field(function))) => Ok(Expr::Call {
                        namespace: Some(name),
                        name: function,
                        args,
                    }),
                    _ => Err(TriggerError::Expression(format!(
                        "不支持的函数调用形式: {}",
                        name
                    ))),
                };
            } else {
                return Ok(Expr::Path {
                    root: name,
                    accessors,
                });
            }
        }
    }

    fn parse_list(&mut self, close: &str) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_conditional()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(",")?;
        }
    }
}
