//! 语法树求值与内置函数

use super::ast::{Accessor, BinaryOp, Expr, PathSegment, UnaryOp};
use super::value::{loose_eq, number_value, strict_eq, stringify, to_number, truthy};
use crate::context::TriggerContext;
use crate::error::{Result, TriggerError};
use chrono::Utc;
use serde_json::Value;

/// 在上下文中求值语法树，`Ok(None)` 表示缺失值
pub fn eval(expr: &Expr, ctx: &TriggerContext) -> Result<Option<Value>> {
    match expr {
        Expr::Literal(value) => Ok(Some(value.clone())),
        Expr::Undefined => Ok(None),
        Expr::Array(items) => {
            let values = items
                .iter()
                .map(|item| eval(item, ctx).map(|v| v.unwrap_or(Value::Null)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(Value::Array(values)))
        }
        Expr::Path { root, accessors } => eval_path(root, accessors, ctx),
        Expr::Unary { op, operand } => {
            let value = eval(operand, ctx)?;
            Ok(Some(match op {
                UnaryOp::Not => Value::Bool(!truthy(&value)),
                UnaryOp::Neg => number_value(-to_number(&value)),
                UnaryOp::Plus => number_value(to_number(&value)),
            }))
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, ctx),
        Expr::Conditional {
            test,
            consequent,
            alternate,
        } => {
            if truthy(&eval(test, ctx)?) {
                eval(consequent, ctx)
            } else {
                eval(alternate, ctx)
            }
        }
        Expr::Call {
            namespace,
            name,
            args,
        } => {
            let args = args
                .iter()
                .map(|arg| eval(arg, ctx))
                .collect::<Result<Vec<_>>>()?;
            call(namespace.as_deref(), name, args, ctx)
        }
    }
}

fn eval_path(root: &str, accessors: &[Accessor], ctx: &TriggerContext) -> Result<Option<Value>> {
    let mut segments = Vec::with_capacity(accessors.len());
    for accessor in accessors {
        let segment = match accessor {
            Accessor::Field(name) => PathSegment::Key(name.clone()),
            Accessor::Computed(index) => match eval(index, ctx)? {
                Some(Value::Number(n)) => match n.as_u64() {
                    Some(i) => PathSegment::Index(i as usize),
                    None => return Ok(None),
                },
                Some(Value::String(key)) => PathSegment::Key(key),
                _ => return Ok(None),
            },
        };
        segments.push(segment);
    }
    Ok(ctx.lookup(root, &segments))
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    ctx: &TriggerContext,
) -> Result<Option<Value>> {
    // 逻辑运算短路并返回操作数本身
    match op {
        BinaryOp::And => {
            let l = eval(left, ctx)?;
            return if truthy(&l) { eval(right, ctx) } else { Ok(l) };
        }
        BinaryOp::Or => {
            let l = eval(left, ctx)?;
            return if truthy(&l) { Ok(l) } else { eval(right, ctx) };
        }
        _ => {}
    }

    let l = eval(left, ctx)?;
    let r = eval(right, ctx)?;

    let value = match op {
        BinaryOp::Add => {
            if matches!(l, Some(Value::String(_))) || matches!(r, Some(Value::String(_))) {
                Value::String(format!("{}{}", stringify(&l), stringify(&r)))
            } else {
                number_value(to_number(&l) + to_number(&r))
            }
        }
        BinaryOp::Sub => number_value(to_number(&l) - to_number(&r)),
        BinaryOp::Mul => number_value(to_number(&l) * to_number(&r)),
        BinaryOp::Div => number_value(to_number(&l) / to_number(&r)),
        BinaryOp::Rem => number_value(to_number(&l) % to_number(&r)),
        BinaryOp::Lt => Value::Bool(relational(&l, &r, |o| o.is_lt())),
        BinaryOp::Lte => Value::Bool(relational(&l, &r, |o| o.is_le())),
        BinaryOp::Gt => Value::Bool(relational(&l, &r, |o| o.is_gt())),
        BinaryOp::Gte => Value::Bool(relational(&l, &r, |o| o.is_ge())),
        BinaryOp::LooseEq => Value::Bool(loose_eq(&l, &r)),
        BinaryOp::LooseNeq => Value::Bool(!loose_eq(&l, &r)),
        BinaryOp::StrictEq => Value::Bool(strict_eq(&l, &r)),
        BinaryOp::StrictNeq => Value::Bool(!strict_eq(&l, &r)),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    };

    Ok(Some(value))
}

/// 关系比较：两侧均为字符串时按字典序，否则按数值（NaN 恒为 false）
fn relational(
    l: &Option<Value>,
    r: &Option<Value>,
    test: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    let ordering = match (l, r) {
        (Some(Value::String(a)), Some(Value::String(b))) => Some(a.cmp(b)),
        _ => to_number(l).partial_cmp(&to_number(r)),
    };
    ordering.is_some_and(test)
}

const MATH_FUNCTIONS: &[&str] = &[
    "abs", "ceil", "floor", "round", "min", "max", "pow", "sqrt", "random",
];

const VALUE_FUNCTIONS: &[&str] = &["len", "lower", "upper", "trim", "number", "string", "now"];

fn call(
    namespace: Option<&str>,
    name: &str,
    args: Vec<Option<Value>>,
    ctx: &TriggerContext,
) -> Result<Option<Value>> {
    match namespace {
        Some("Math") if MATH_FUNCTIONS.contains(&name) => Ok(Some(math(name, &args))),
        None if MATH_FUNCTIONS.contains(&name) => Ok(Some(math(name, &args))),
        None if VALUE_FUNCTIONS.contains(&name) => Ok(Some(value_function(name, &args))),
        Some("helpers") | None => {
            let helper = ctx
                .helpers
                .get(name)
                .ok_or_else(|| TriggerError::Expression(format!("未知函数: {}", name)))?;
            let args: Vec<Value> = args.into_iter().map(|a| a.unwrap_or(Value::Null)).collect();
            Ok(Some(helper(&args)))
        }
        Some(ns) => Err(TriggerError::Expression(format!("未知函数: {}.{}", ns, name))),
    }
}

fn math(name: &str, args: &[Option<Value>]) -> Value {
    let arg = |i: usize| args.get(i).map_or(f64::NAN, to_number);

    let result = match name {
        "abs" => arg(0).abs(),
        "ceil" => arg(0).ceil(),
        "floor" => arg(0).floor(),
        "round" => (arg(0) + 0.5).floor(),
        "sqrt" => arg(0).sqrt(),
        "pow" => arg(0).powf(arg(1)),
        "random" => rand::random::<f64>(),
        "min" | "max" => {
            // 单个数组参数时对数组元素求值
            let numbers: Vec<f64> = match args {
                [Some(Value::Array(items))] => {
                    items.iter().map(|v| to_number(&Some(v.clone()))).collect()
                }
                _ => args.iter().map(to_number).collect(),
            };
            if numbers.iter().any(|n| n.is_nan()) {
                f64::NAN
            } else if name == "min" {
                numbers.into_iter().fold(f64::INFINITY, f64::min)
            } else {
                numbers.into_iter().fold(f64::NEG_INFINITY, f64::max)
            }
        }
        _ => f64::NAN,
    };

    number_value(result)
}

fn value_function(name: &str, args: &[Option<Value>]) -> Value {
    let first = args.first().cloned().flatten();

    match name {
        "len" => Value::from(match &first {
            Some(Value::String(s)) => s.chars().count(),
            Some(Value::Array(items)) => items.len(),
            Some(Value::Object(map)) => map.len(),
            _ => 0,
        }),
        "lower" => Value::String(stringify(&first).to_lowercase()),
        "upper" => Value::String(stringify(&first).to_uppercase()),
        "trim" => Value::String(stringify(&first).trim().to_string()),
        "number" => number_value(to_number(&first)),
        "string" => Value::String(stringify(&first)),
        "now" => Value::from(Utc::now().timestamp_millis()),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parser::parse;
    use serde_json::json;

    fn ctx() -> TriggerContext {
        TriggerContext::new(
            "order.created",
            json!({ "amount": 150, "name": "Alice", "items": [1, 2, 3], "key": "amount" }),
        )
        .with_var("limit", 100)
        .with_helper("double", |args: &[Value]| {
            number_value(args.first().and_then(Value::as_f64).unwrap_or(0.0) * 2.0)
        })
    }

    fn run(source: &str) -> Option<Value> {
        eval(&parse(source).unwrap(), &ctx()).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run("10 + 5"), Some(json!(15)));
        assert_eq!(run("data.amount * 2 - vars.limit"), Some(json!(200)));
        assert_eq!(run("7 % 4"), Some(json!(3)));
        assert_eq!(run("1 / 4"), Some(json!(0.25)));
        assert_eq!(run("-data.amount"), Some(json!(-150)));
        assert_eq!(run("1 / 0"), Some(Value::Null));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(run("'Hi ' + data.name"), Some(json!("Hi Alice")));
        assert_eq!(run("'n=' + 1 + 2"), Some(json!("n=12")));
        assert_eq!(run("1 + 2 + 'x'"), Some(json!("3x")));
        assert_eq!(run("'v:' + data.missing"), Some(json!("v:undefined")));
    }

    #[test]
    fn test_comparison_and_logic() {
        assert_eq!(run("data.amount > vars.limit"), Some(json!(true)));
        assert_eq!(run("data.amount >= 150 && data.name == 'Alice'"), Some(json!(true)));
        assert_eq!(run("data.missing || 'fallback'"), Some(json!("fallback")));
        assert_eq!(run("0 && data.amount"), Some(json!(0)));
        assert_eq!(run("!data.missing"), Some(json!(true)));
        assert_eq!(run("'10' == 10"), Some(json!(true)));
        assert_eq!(run("'10' === 10"), Some(json!(false)));
        assert_eq!(run("'b' > 'a'"), Some(json!(true)));
        assert_eq!(run("data.missing > 1"), Some(json!(false)));
    }

    #[test]
    fn test_ternary_and_paths() {
        assert_eq!(run("data.amount > 100 ? 'big' : 'small'"), Some(json!("big")));
        assert_eq!(run("data.items[1]"), Some(json!(2)));
        assert_eq!(run("data[data.key]"), Some(json!(150)));
        assert_eq!(run("data.items.length"), Some(json!(3)));
        assert_eq!(run("data.a.b.c"), None);
        assert_eq!(run("[data.amount, undefined]"), Some(json!([150, null])));
    }

    #[test]
    fn test_builtin_functions() {
        assert_eq!(run("max(1, 5, 3)"), Some(json!(5)));
        assert_eq!(run("Math.min(data.items)"), Some(json!(1)));
        assert_eq!(run("Math.round(2.5)"), Some(json!(3)));
        assert_eq!(run("floor(-1.5)"), Some(json!(-2)));
        assert_eq!(run("pow(2, 10)"), Some(json!(1024)));
        assert_eq!(run("len(data.name)"), Some(json!(5)));
        assert_eq!(run("upper(data.name)"), Some(json!("ALICE")));
        assert_eq!(run("number('42')"), Some(json!(42)));
        assert_eq!(run("string(42)"), Some(json!("42")));

        let r = run("random()").unwrap().as_f64().unwrap();
        assert!((0.0..1.0).contains(&r));
    }

    #[test]
    fn test_host_helpers() {
        assert_eq!(run("helpers.double(21)"), Some(json!(42)));
        assert_eq!(run("double(data.amount)"), Some(json!(300)));
    }

    #[test]
    fn test_unknown_function_is_error() {
        let context = ctx();
        assert!(eval(&parse("exec('rm')").unwrap(), &context).is_err());
        assert!(eval(&parse("process.exit(1)").unwrap(), &context).is_err());
        assert!(eval(&parse("Math.tan(1)").unwrap(), &context).is_err());
    }
}
