//! Dynamic values stored in the namespace and produced by cells.

use serde::{Deserialize, Serialize};
use syn::BinOp;

use super::error::ExecError;

/// A runtime value.
///
/// Serializes untagged so JSON clients see plain values: `null`, `true`,
/// `1`, `1.5`, `"text"` and arrays. Tuples serialize as arrays.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    #[serde(skip_deserializing)]
    Tuple(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "()",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Unit)
    }

    pub fn as_bool(&self) -> Result<bool, ExecError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(ExecError::type_error(format!(
                "expected bool, found {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_int(&self) -> Result<i64, ExecError> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(ExecError::type_error(format!(
                "expected int, found {}",
                other.type_name()
            ))),
        }
    }

    fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Equality as used by `==`, `match` literals and `assert_eq!`. Ints and
    /// floats compare numerically.
    pub fn loose_eq(&self, other: &Value) -> bool {
        loose_eq(self, other)
    }

    /// Debug representation, as produced by `{:?}`.
    pub fn debug_repr(&self) -> String {
        match self {
            Value::Str(s) => format!("{s:?}"),
            other => other.to_string(),
        }
    }

    /// Elements of a sequence value, for iteration and destructuring.
    pub fn into_items(self) -> Result<Vec<Value>, ExecError> {
        match self {
            Value::List(items) | Value::Tuple(items) => Ok(items),
            Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            other => Err(ExecError::type_error(format!(
                "{} is not iterable",
                other.type_name()
            ))),
        }
    }

    pub fn index(&self, index: &Value) -> Result<Value, ExecError> {
        let i = index.as_int()?;
        let items = match self {
            Value::List(items) | Value::Tuple(items) => items,
            Value::Str(s) => {
                return usize::try_from(i)
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Value::Str(c.to_string()))
                    .ok_or_else(|| {
                        ExecError::index(format!(
                            "index {i} out of range for string of length {}",
                            s.chars().count()
                        ))
                    });
            }
            other => {
                return Err(ExecError::type_error(format!(
                    "cannot index into {}",
                    other.type_name()
                )));
            }
        };
        usize::try_from(i)
            .ok()
            .and_then(|i| items.get(i))
            .cloned()
            .ok_or_else(|| {
                ExecError::index(format!(
                    "index {i} out of range for length {}",
                    items.len()
                ))
            })
    }

    /// Apply a binary operator. Short-circuiting `&&`/`||` are handled by the
    /// interpreter before operands are evaluated.
    pub fn binary(op: &BinOp, lhs: Value, rhs: Value) -> Result<Value, ExecError> {
        use Value::*;

        match op {
            BinOp::Eq(_) => return Ok(Bool(loose_eq(&lhs, &rhs))),
            BinOp::Ne(_) => return Ok(Bool(!loose_eq(&lhs, &rhs))),
            BinOp::Lt(_) | BinOp::Le(_) | BinOp::Gt(_) | BinOp::Ge(_) => {
                let ord = compare(&lhs, &rhs)?;
                let result = match op {
                    BinOp::Lt(_) => ord.is_lt(),
                    BinOp::Le(_) => ord.is_le(),
                    BinOp::Gt(_) => ord.is_gt(),
                    _ => ord.is_ge(),
                };
                return Ok(Bool(result));
            }
            _ => {}
        }

        match (lhs, rhs) {
            (Int(a), Int(b)) => int_op(op, a, b),
            (Str(a), Str(b)) if matches!(op, BinOp::Add(_) | BinOp::AddAssign(_)) => {
                Ok(Str(a + &b))
            }
            (List(mut a), List(b)) if matches!(op, BinOp::Add(_) | BinOp::AddAssign(_)) => {
                a.extend(b);
                Ok(List(a))
            }
            (Bool(a), Bool(b)) => match op {
                BinOp::BitAnd(_) | BinOp::BitAndAssign(_) => Ok(Bool(a & b)),
                BinOp::BitOr(_) | BinOp::BitOrAssign(_) => Ok(Bool(a | b)),
                BinOp::BitXor(_) | BinOp::BitXorAssign(_) => Ok(Bool(a ^ b)),
                _ => Err(unsupported_operands(op, "bool", "bool")),
            },
            (a, b) => match (a.as_float(), b.as_float()) {
                (Some(x), Some(y)) => float_op(op, x, y),
                _ => Err(unsupported_operands(op, a.type_name(), b.type_name())),
            },
        }
    }

    /// Call a built-in method on this value.
    pub fn call_method(self, method: &str, args: Vec<Value>) -> Result<Value, ExecError> {
        use Value::*;

        let arity = |n: usize| -> Result<(), ExecError> {
            if args.len() == n {
                Ok(())
            } else {
                Err(ExecError::type_error(format!(
                    "`{method}` takes {n} argument(s), {} given",
                    args.len()
                )))
            }
        };

        match (method, self) {
            ("len", List(items) | Tuple(items)) => {
                arity(0)?;
                Ok(Int(items.len() as i64))
            }
            ("len", Str(s)) => {
                arity(0)?;
                Ok(Int(s.chars().count() as i64))
            }
            ("is_empty", List(items)) => {
                arity(0)?;
                Ok(Bool(items.is_empty()))
            }
            ("is_empty", Str(s)) => {
                arity(0)?;
                Ok(Bool(s.is_empty()))
            }
            ("abs", Int(i)) => {
                arity(0)?;
                i.checked_abs()
                    .map(Int)
                    .ok_or_else(|| ExecError::arithmetic("attempt to negate with overflow"))
            }
            ("abs", Float(f)) => {
                arity(0)?;
                Ok(Float(f.abs()))
            }
            ("pow", Int(base)) => {
                arity(1)?;
                let exp = u32::try_from(args[0].as_int()?)
                    .map_err(|_| ExecError::arithmetic("exponent must be a non-negative int"))?;
                base.checked_pow(exp)
                    .map(Int)
                    .ok_or_else(|| ExecError::arithmetic("attempt to multiply with overflow"))
            }
            ("pow", Float(base)) => {
                arity(1)?;
                let exp = args[0]
                    .as_float()
                    .ok_or_else(|| ExecError::type_error("exponent must be numeric"))?;
                Ok(Float(base.powf(exp)))
            }
            ("sqrt", value @ (Int(_) | Float(_))) => {
                arity(0)?;
                Ok(Float(value.as_float().unwrap_or_default().sqrt()))
            }
            ("min" | "max", lhs @ (Int(_) | Float(_) | Str(_))) => {
                arity(1)?;
                let rhs = args.into_iter().next().unwrap_or_default();
                pick(method == "min", lhs, rhs)
            }
            ("to_string", value) => {
                arity(0)?;
                Ok(Str(value.to_string()))
            }
            ("to_uppercase", Str(s)) => {
                arity(0)?;
                Ok(Str(s.to_uppercase()))
            }
            ("to_lowercase", Str(s)) => {
                arity(0)?;
                Ok(Str(s.to_lowercase()))
            }
            ("contains", List(items)) => {
                arity(1)?;
                Ok(Bool(items.iter().any(|item| loose_eq(item, &args[0]))))
            }
            ("contains", Str(s)) => {
                arity(1)?;
                match &args[0] {
                    Str(needle) => Ok(Bool(s.contains(needle.as_str()))),
                    other => Err(ExecError::type_error(format!(
                        "cannot search a str for {}",
                        other.type_name()
                    ))),
                }
            }
            ("sum", List(items)) => {
                arity(0)?;
                let add = BinOp::Add(Default::default());
                items
                    .into_iter()
                    .try_fold(Int(0), |acc, item| Value::binary(&add, acc, item))
            }
            ("iter" | "collect", value @ (List(_) | Tuple(_) | Str(_))) => {
                arity(0)?;
                Ok(value)
            }
            ("rev", List(mut items)) => {
                arity(0)?;
                items.reverse();
                Ok(List(items))
            }
            (method, value) => Err(ExecError::type_error(format!(
                "no method `{method}` on {}",
                value.type_name()
            ))),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Unit => f.write_str("()"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => write_seq(f, "[", items, "]"),
            Value::Tuple(items) if items.len() == 1 => write_seq(f, "(", items, ",)"),
            Value::Tuple(items) => write_seq(f, "(", items, ")"),
        }
    }
}

fn write_seq(
    f: &mut std::fmt::Formatter<'_>,
    open: &str,
    items: &[Value],
    close: &str,
) -> std::fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        f.write_str(&item.debug_repr())?;
    }
    f.write_str(close)
}

/// Equality that treats `1 == 1.0` as true.
fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) => {
            lhs.as_float() == rhs.as_float()
        }
        _ => lhs == rhs,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering, ExecError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        _ => match (lhs.as_float(), rhs.as_float()) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| ExecError::arithmetic("cannot compare NaN")),
            _ => Err(ExecError::type_error(format!(
                "cannot compare {} with {}",
                lhs.type_name(),
                rhs.type_name()
            ))),
        },
    }
}

fn pick(min: bool, lhs: Value, rhs: Value) -> Result<Value, ExecError> {
    let ord = compare(&lhs, &rhs)?;
    Ok(if ord.is_le() == min { lhs } else { rhs })
}

fn int_op(op: &BinOp, a: i64, b: i64) -> Result<Value, ExecError> {
    let overflow = |what: &str| ExecError::arithmetic(format!("attempt to {what} with overflow"));
    let result = match op {
        BinOp::Add(_) | BinOp::AddAssign(_) => a.checked_add(b).ok_or_else(|| overflow("add"))?,
        BinOp::Sub(_) | BinOp::SubAssign(_) => {
            a.checked_sub(b).ok_or_else(|| overflow("subtract"))?
        }
        BinOp::Mul(_) | BinOp::MulAssign(_) => {
            a.checked_mul(b).ok_or_else(|| overflow("multiply"))?
        }
        BinOp::Div(_) | BinOp::DivAssign(_) => {
            if b == 0 {
                return Err(ExecError::arithmetic("attempt to divide by zero"));
            }
            a.checked_div(b).ok_or_else(|| overflow("divide"))?
        }
        BinOp::Rem(_) | BinOp::RemAssign(_) => {
            if b == 0 {
                return Err(ExecError::arithmetic(
                    "attempt to calculate the remainder with a divisor of zero",
                ));
            }
            a.checked_rem(b).ok_or_else(|| overflow("calculate the remainder"))?
        }
        BinOp::BitAnd(_) | BinOp::BitAndAssign(_) => a & b,
        BinOp::BitOr(_) | BinOp::BitOrAssign(_) => a | b,
        BinOp::BitXor(_) | BinOp::BitXorAssign(_) => a ^ b,
        BinOp::Shl(_) | BinOp::ShlAssign(_) => u32::try_from(b)
            .ok()
            .and_then(|s| a.checked_shl(s))
            .ok_or_else(|| overflow("shift left"))?,
        BinOp::Shr(_) | BinOp::ShrAssign(_) => u32::try_from(b)
            .ok()
            .and_then(|s| a.checked_shr(s))
            .ok_or_else(|| overflow("shift right"))?,
        _ => return Err(unsupported_operands(op, "int", "int")),
    };
    Ok(Value::Int(result))
}

fn float_op(op: &BinOp, a: f64, b: f64) -> Result<Value, ExecError> {
    let result = match op {
        BinOp::Add(_) | BinOp::AddAssign(_) => a + b,
        BinOp::Sub(_) | BinOp::SubAssign(_) => a - b,
        BinOp::Mul(_) | BinOp::MulAssign(_) => a * b,
        BinOp::Div(_) | BinOp::DivAssign(_) => a / b,
        BinOp::Rem(_) | BinOp::RemAssign(_) => a % b,
        _ => return Err(unsupported_operands(op, "float", "float")),
    };
    Ok(Value::Float(result))
}

fn unsupported_operands(op: &BinOp, lhs: &str, rhs: &str) -> ExecError {
    use quote::ToTokens;
    ExecError::type_error(format!(
        "unsupported operand types for `{}`: {lhs} and {rhs}",
        op.to_token_stream()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(src: &str) -> BinOp {
        syn::parse_str(src).unwrap()
    }

    #[test]
    fn test_int_arithmetic_is_checked() {
        assert_eq!(
            Value::binary(&op("+"), Value::Int(2), Value::Int(3)).unwrap(),
            Value::Int(5)
        );
        let err = Value::binary(&op("/"), Value::Int(1), Value::Int(0)).unwrap_err();
        assert_eq!(err.kind, super::super::ExecErrorKind::Arithmetic);
        assert!(Value::binary(&op("*"), Value::Int(i64::MAX), Value::Int(2)).is_err());
    }

    #[test]
    fn test_mixed_numeric_promotes_to_float() {
        assert_eq!(
            Value::binary(&op("+"), Value::Int(1), Value::Float(0.5)).unwrap(),
            Value::Float(1.5)
        );
        assert_eq!(
            Value::binary(&op("=="), Value::Int(1), Value::Float(1.0)).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_string_concat_and_type_errors() {
        assert_eq!(
            Value::binary(&op("+"), Value::Str("a".into()), Value::Str("b".into())).unwrap(),
            Value::Str("ab".into())
        );
        assert!(Value::binary(&op("-"), Value::Str("a".into()), Value::Int(1)).is_err());
    }

    #[test]
    fn test_display_and_debug() {
        let list = Value::List(vec![Value::Int(1), Value::Str("a".into()), Value::Float(2.0)]);
        assert_eq!(list.to_string(), "[1, \"a\", 2.0]");
        assert_eq!(Value::Str("hi".into()).to_string(), "hi");
        assert_eq!(Value::Str("hi".into()).debug_repr(), "\"hi\"");
        assert_eq!(Value::Tuple(vec![Value::Int(1)]).to_string(), "(1,)");
    }

    #[test]
    fn test_methods() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(list.clone().call_method("len", vec![]).unwrap(), Value::Int(3));
        assert_eq!(list.clone().call_method("sum", vec![]).unwrap(), Value::Int(6));
        assert_eq!(
            list.call_method("contains", vec![Value::Int(2)]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            Value::Int(2).call_method("pow", vec![Value::Int(10)]).unwrap(),
            Value::Int(1024)
        );
        assert!(Value::Int(1).call_method("nope", vec![]).is_err());
    }

    #[test]
    fn test_json_shape() {
        let value = Value::List(vec![Value::Unit, Value::Bool(true), Value::Int(1)]);
        assert_eq!(serde_json::to_string(&value).unwrap(), "[null,true,1]");

        let parsed: Value = serde_json::from_str("[1, 2.5, \"x\"]").unwrap();
        assert_eq!(
            parsed,
            Value::List(vec![Value::Int(1), Value::Float(2.5), Value::Str("x".into())])
        );
    }
}
