//! Minimal `format!`-style string templates.
//!
//! Supports `{}`, `{0}`, `{name}`, `{:?}`, `{:.2}` and the `{{` / `}}` escapes.
//! Width, fill and alignment are accepted and ignored.

use super::error::ExecError;
use super::value::Value;

/// Which argument a placeholder refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgRef {
    Next,
    Index(usize),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    Text(String),
    Placeholder {
        arg: ArgRef,
        debug: bool,
        precision: Option<usize>,
    },
}

/// Split a template into literal text and placeholders.
pub fn parse(template: &str) -> Result<Vec<Piece>, ExecError> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                text.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                text.push('}');
            }
            '{' => {
                let mut inner = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => inner.push(ch),
                        None => {
                            return Err(ExecError::panic(format!(
                                "invalid format string: unclosed placeholder in {template:?}"
                            )));
                        }
                    }
                }
                if !text.is_empty() {
                    pieces.push(Piece::Text(std::mem::take(&mut text)));
                }
                pieces.push(placeholder(&inner)?);
            }
            '}' => {
                return Err(ExecError::panic(format!(
                    "invalid format string: unmatched `}}` in {template:?}"
                )));
            }
            other => text.push(other),
        }
    }
    if !text.is_empty() {
        pieces.push(Piece::Text(text));
    }
    Ok(pieces)
}

fn placeholder(inner: &str) -> Result<Piece, ExecError> {
    let (arg, spec) = inner.split_once(':').unwrap_or((inner, ""));
    let arg = arg.trim();
    let arg = if arg.is_empty() {
        ArgRef::Next
    } else if let Ok(index) = arg.parse::<usize>() {
        ArgRef::Index(index)
    } else if arg.chars().all(|c| c.is_alphanumeric() || c == '_') {
        ArgRef::Name(arg.to_string())
    } else {
        return Err(ExecError::panic(format!(
            "invalid format string: bad argument `{arg}`"
        )));
    };

    let debug = spec.ends_with('?');
    let precision = spec
        .split_once('.')
        .map(|(_, rest)| rest.trim_end_matches('?'))
        .and_then(|digits| digits.parse::<usize>().ok());

    Ok(Piece::Placeholder {
        arg,
        debug,
        precision,
    })
}

/// Names captured inline by a template (`"{total}"`), used by dependency analysis.
pub fn captured_names(template: &str) -> Vec<String> {
    parse(template)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Placeholder {
                arg: ArgRef::Name(name),
                ..
            } => Some(name),
            _ => None,
        })
        .collect()
}

/// Render parsed pieces. `resolve_name` supplies named and captured arguments.
pub fn render(
    pieces: &[Piece],
    positional: &[Value],
    mut resolve_name: impl FnMut(&str) -> Result<Value, ExecError>,
) -> Result<String, ExecError> {
    let mut out = String::new();
    let mut next = 0;

    for piece in pieces {
        let (arg, debug, precision) = match piece {
            Piece::Text(text) => {
                out.push_str(text);
                continue;
            }
            Piece::Placeholder {
                arg,
                debug,
                precision,
            } => (arg, *debug, *precision),
        };

        let value = match arg {
            ArgRef::Next => {
                next += 1;
                positional_arg(positional, next - 1)?
            }
            ArgRef::Index(i) => positional_arg(positional, *i)?,
            ArgRef::Name(name) => resolve_name(name)?,
        };

        match (&value, precision) {
            (Value::Float(f), Some(p)) => out.push_str(&format!("{f:.p$}")),
            (Value::Int(i), Some(p)) => out.push_str(&format!("{:.p$}", *i as f64)),
            _ if debug => out.push_str(&value.debug_repr()),
            _ => out.push_str(&value.to_string()),
        }
    }
    Ok(out)
}

fn positional_arg(positional: &[Value], index: usize) -> Result<Value, ExecError> {
    positional.get(index).cloned().ok_or_else(|| {
        ExecError::panic(format!(
            "invalid format string: argument {index} missing ({} given)",
            positional.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_names(name: &str) -> Result<Value, ExecError> {
        Err(ExecError::name(format!("`{name}` is not defined")))
    }

    #[test]
    fn test_positional_and_escapes() {
        let pieces = parse("{{{}}} = {1}, {0}").unwrap();
        let out = render(&pieces, &[Value::Int(1), Value::Int(2)], no_names).unwrap();
        assert_eq!(out, "{1} = 2, 1");
    }

    #[test]
    fn test_debug_and_precision() {
        let pieces = parse("{:?} {:.2}").unwrap();
        let out = render(
            &pieces,
            &[Value::Str("a".into()), Value::Float(3.14159)],
            no_names,
        )
        .unwrap();
        assert_eq!(out, "\"a\" 3.14");
    }

    #[test]
    fn test_captured_names() {
        assert_eq!(captured_names("{x} and {y:?} but not {} or {0}"), vec!["x", "y"]);
        assert!(captured_names("{{literal}}").is_empty());
    }

    #[test]
    fn test_missing_argument_is_an_error() {
        let pieces = parse("{} {}").unwrap();
        assert!(render(&pieces, &[Value::Int(1)], no_names).is_err());
        assert!(parse("{").is_err());
    }
}
