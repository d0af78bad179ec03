use evalexpr::{
    build_operator_tree, ContextWithMutableFunctions, EvalexprError, EvalexprResult, Function,
    HashMapContext, Node, Value,
};
use thiserror::Error;
use tracing::error;

/// Evaluator function applied to every operand of `&&`, `||` and `!`.
pub const TRUTHY_FN: &str = "truthy";

/// Failure to compile or evaluate one rule expression.
#[derive(Error, Debug)]
pub enum ExpressionError {
    #[error("compile error: {0}")]
    Compile(EvalexprError),

    #[error("evaluation error: {0}")]
    Evaluate(EvalexprError),

    #[error("expression produced a non-numeric value: {0}")]
    NonNumeric(Value),
}

/// Rewrite the rule dialect into evaluator syntax.
///
/// Outside string literals: `and`/`or`/`not` become `&&`/`||`/`!`, a lone
/// `=` becomes `==` and `<>` becomes `!=`. Single-quoted strings are turned
/// into double-quoted ones, and integer literals become float literals.
pub fn normalize_expression(expr: &str) -> String {
    let chars: Vec<char> = expr.chars().collect();
    let mut out = String::with_capacity(expr.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => out.push_str(&read_string(&chars, &mut i)),
            '\'' => {
                out.push('"');
                i += 1;
                while i < chars.len() {
                    let c = chars[i];
                    i += 1;
                    match c {
                        '\'' => break,
                        '\\' if i < chars.len() => {
                            out.push('\\');
                            out.push(chars[i]);
                            i += 1;
                        }
                        '"' => out.push_str("\\\""),
                        _ => out.push(c),
                    }
                }
                out.push('"');
            }
            '=' => {
                let prev = out.chars().last();
                let next = chars.get(i + 1).copied();
                if next == Some('=') {
                    out.push_str("==");
                    i += 2;
                } else if matches!(prev, Some('<') | Some('>') | Some('!') | Some('=')) {
                    out.push('=');
                    i += 1;
                } else {
                    out.push_str("==");
                    i += 1;
                }
            }
            '<' if chars.get(i + 1) == Some(&'>') => {
                out.push_str("!=");
                i += 2;
            }
            c if c.is_ascii_digit()
                || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) =>
            {
                let start = i;
                let mut is_float = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    is_float |= chars[i] == '.';
                    i += 1;
                }
                if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                    is_float = true;
                    i += 1;
                    if i < chars.len() && matches!(chars[i], '+' | '-') {
                        i += 1;
                    }
                }
                // Exponent digits, or a suffix the evaluator will reject anyway
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    is_float = true;
                    i += 1;
                }
                out.extend(&chars[start..i]);
                if !is_float {
                    out.push_str(".0");
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && is_identifier_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => out.push_str("&&"),
                    "or" => out.push_str("||"),
                    "not" => out.push('!'),
                    _ => out.push_str(&word),
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == ':'
}

/// Wrap every operand of `&&`, `||` and `!` in [`TRUTHY_FN`].
///
/// Expects evaluator syntax, i.e. the output of [`normalize_expression`].
/// Comparisons pass through unchanged; numbers count as true when non-zero.
pub fn apply_truthiness(expr: &str) -> String {
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    let mut out = String::with_capacity(expr.len() + 16);

    while i < chars.len() {
        out.push_str(&rewrite_group(&chars, &mut i));
        if i < chars.len() {
            // Unbalanced `)`; keep it for the compiler to report
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

/// Rewrite up to, but not including, the `)` closing the current group.
fn rewrite_group(chars: &[char], i: &mut usize) -> String {
    let mut out = String::new();
    let mut chain: Vec<(String, &'static str)> = Vec::new();
    let mut segment = String::new();

    while *i < chars.len() {
        let c = chars[*i];
        let next = chars.get(*i + 1).copied();
        match c {
            '"' => segment.push_str(&read_string(chars, i)),
            '(' => {
                *i += 1;
                segment.push_str(&read_parenthesized(chars, i));
            }
            ')' => break,
            '&' if next == Some('&') => {
                chain.push((std::mem::take(&mut segment), "&&"));
                *i += 2;
            }
            '|' if next == Some('|') => {
                chain.push((std::mem::take(&mut segment), "||"));
                *i += 2;
            }
            ',' | ';' => {
                flush_chain(&mut out, &mut chain, &mut segment);
                out.push(c);
                *i += 1;
            }
            '!' if next != Some('=') => {
                *i += 1;
                segment.push_str(&negate(chars, i));
            }
            _ => {
                segment.push(c);
                *i += 1;
            }
        }
    }

    flush_chain(&mut out, &mut chain, &mut segment);
    out
}

fn flush_chain(out: &mut String, chain: &mut Vec<(String, &'static str)>, segment: &mut String) {
    let last = std::mem::take(segment);
    if chain.is_empty() {
        out.push_str(&last);
        return;
    }
    for (operand, op) in chain.drain(..) {
        out.push_str(&truthy_operand(&operand));
        out.push_str(op);
    }
    out.push_str(&truthy_operand(&last));
}

fn truthy_operand(operand: &str) -> String {
    let trimmed = operand.trim();
    if trimmed.is_empty() {
        return operand.to_string();
    }
    let lead = &operand[..operand.len() - operand.trim_start().len()];
    let trail = &operand[operand.trim_end().len()..];
    format!("{lead}{TRUTHY_FN}({trimmed}){trail}")
}

/// `!` followed by its operand, with the operand wrapped.
fn negate(chars: &[char], i: &mut usize) -> String {
    while *i < chars.len() && chars[*i].is_whitespace() {
        *i += 1;
    }

    let operand = match chars.get(*i) {
        Some('(') => {
            *i += 1;
            read_parenthesized(chars, i)
        }
        Some('!') if chars.get(*i + 1) != Some(&'=') => {
            *i += 1;
            negate(chars, i)
        }
        Some('-') => {
            *i += 1;
            format!("-{}", negate_operand_token(chars, i))
        }
        Some('"') => read_string(chars, i),
        _ => negate_operand_token(chars, i),
    };
    format!("!{TRUTHY_FN}({operand})")
}

/// A bare identifier, number or call.
fn negate_operand_token(chars: &[char], i: &mut usize) -> String {
    let start = *i;
    while *i < chars.len() && (is_identifier_char(chars[*i]) || chars[*i] == '.') {
        *i += 1;
    }
    let mut token: String = chars[start..*i].iter().collect();
    if !token.is_empty() && chars.get(*i) == Some(&'(') {
        *i += 1;
        token.push_str(&read_parenthesized(chars, i));
    }
    token
}

/// Called just past a `(`; returns the rewritten group with both parens.
fn read_parenthesized(chars: &[char], i: &mut usize) -> String {
    let inner = rewrite_group(chars, i);
    if *i < chars.len() {
        *i += 1;
        format!("({inner})")
    } else {
        format!("({inner}")
    }
}

/// Copy a double-quoted literal, honouring escapes.
fn read_string(chars: &[char], i: &mut usize) -> String {
    let mut out = String::from('"');
    *i += 1;
    while *i < chars.len() {
        let c = chars[*i];
        out.push(c);
        *i += 1;
        if c == '\\' && *i < chars.len() {
            out.push(chars[*i]);
            *i += 1;
        } else if c == '"' {
            break;
        }
    }
    out
}

fn truthy(value: &Value) -> EvalexprResult<Value> {
    match value {
        Value::Boolean(b) => Ok(Value::Boolean(*b)),
        Value::Float(f) => Ok(Value::Boolean(*f != 0.0)),
        Value::Int(n) => Ok(Value::Boolean(*n != 0)),
        other => Err(EvalexprError::expected_boolean(other.clone())),
    }
}

/// An empty binding table with the evaluator helpers registered.
pub fn binding_table() -> HashMapContext {
    let mut table = HashMapContext::new();
    if let Err(e) = table.set_function(TRUTHY_FN.to_string(), Function::new(truthy)) {
        error!(error = %e, "Failed to register rule helper function");
    }
    table
}

/// Compile a rule expression.
pub fn compile_expression(expr: &str) -> Result<Node, ExpressionError> {
    build_operator_tree(&apply_truthiness(&normalize_expression(expr)))
        .map_err(ExpressionError::Compile)
}

/// Convert an evaluation result into a score.
///
/// Booleans map to 1.0 and 0.0; anything else non-numeric is a fault.
#[inline]
pub fn value_to_score(value: Value) -> Result<f64, ExpressionError> {
    match value {
        Value::Boolean(b) => Ok(if b { 1.0 } else { 0.0 }),
        Value::Float(f) => Ok(f),
        Value::Int(i) => Ok(i as f64),
        other => Err(ExpressionError::NonNumeric(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalexpr::ContextWithMutableVariables;

    fn eval(expr: &str, ctx: &HashMapContext) -> Result<f64, ExpressionError> {
        let node = compile_expression(expr)?;
        let value = node
            .eval_with_context(ctx)
            .map_err(ExpressionError::Evaluate)?;
        value_to_score(value)
    }

    fn table() -> HashMapContext {
        let mut ctx = binding_table();
        ctx.set_value("amount".into(), Value::Float(1500.0)).unwrap();
        ctx.set_value("merchant_category".into(), Value::Float(5411.0))
            .unwrap();
        ctx.set_value("hourly_count".into(), Value::Float(3.0))
            .unwrap();
        ctx.set_value("ip_blacklist_match".into(), Value::Float(1.0))
            .unwrap();
        ctx.set_value("currency".into(), Value::String("USD".into()))
            .unwrap();
        ctx
    }

    #[test]
    fn test_normalize_keywords() {
        assert_eq!(
            normalize_expression("amount > 10 and not (a or b)"),
            "amount > 10.0 && ! (a || b)"
        );
        // Keywords embedded in identifiers are untouched
        assert_eq!(normalize_expression("brand_or_type"), "brand_or_type");
        assert_eq!(normalize_expression("android"), "android");
    }

    #[test]
    fn test_normalize_leaves_strings_alone() {
        assert_eq!(
            normalize_expression(r#"currency == "and or 5""#),
            r#"currency == "and or 5""#
        );
        assert_eq!(
            normalize_expression("currency = 'USD' or currency <> 'EUR'"),
            r#"currency == "USD" || currency != "EUR""#
        );
        assert_eq!(
            normalize_expression("amount >= 5 and amount <= 9"),
            "amount >= 5.0 && amount <= 9.0"
        );
        assert_eq!(normalize_expression("a != 1"), "a != 1.0");
    }

    #[test]
    fn test_normalize_number_literals() {
        assert_eq!(normalize_expression("3 / 4"), "3.0 / 4.0");
        assert_eq!(normalize_expression("amount > 1.5"), "amount > 1.5");
        assert_eq!(normalize_expression("amount > .5"), "amount > .5");
        assert_eq!(normalize_expression("amount > 1e3"), "amount > 1e3");
        assert_eq!(normalize_expression("rule_2 > 0"), "rule_2 > 0.0");
    }

    #[test]
    fn test_truthiness_wrapping() {
        assert_eq!(
            apply_truthiness("flag && amount > 100.0"),
            "truthy(flag) && truthy(amount > 100.0)"
        );
        assert_eq!(apply_truthiness("! flag"), "!truthy(flag)");
        assert_eq!(
            apply_truthiness("!(a || b) && c"),
            "truthy(!truthy((truthy(a) || truthy(b)))) && truthy(c)"
        );
        assert_eq!(apply_truthiness("a != 1.0"), "a != 1.0");
        assert_eq!(
            apply_truthiness(r#"currency == "a && b""#),
            r#"currency == "a && b""#
        );
    }

    #[test]
    fn test_boolean_and_numeric_results() {
        let ctx = table();

        assert_eq!(eval("amount > 1000", &ctx).unwrap(), 1.0);
        assert_eq!(eval("amount > 2000", &ctx).unwrap(), 0.0);
        assert_eq!(eval("amount / 1000", &ctx).unwrap(), 1.5);
        assert_eq!(eval("merchant_category == 5411", &ctx).unwrap(), 1.0);
        assert_eq!(
            eval("currency == 'USD' and amount > 1000", &ctx).unwrap(),
            1.0
        );
    }

    #[test]
    fn test_arithmetic_is_floating_point() {
        let ctx = table();

        assert_eq!(eval("3 / 4", &ctx).unwrap(), 0.75);
        assert_eq!(eval("hourly_count / 4", &ctx).unwrap(), 0.75);
        assert_eq!(eval("amount == 1500", &ctx).unwrap(), 1.0);
        assert_eq!(eval("ip_blacklist_match == 1.0", &ctx).unwrap(), 1.0);
    }

    #[test]
    fn test_non_zero_is_true() {
        let ctx = table();

        assert_eq!(eval("ip_blacklist_match and amount > 100", &ctx).unwrap(), 1.0);
        assert_eq!(eval("not ip_blacklist_match", &ctx).unwrap(), 0.0);
        assert_eq!(eval("not (hourly_count - 3)", &ctx).unwrap(), 1.0);
        assert_eq!(eval("0 or hourly_count", &ctx).unwrap(), 1.0);
        assert!(matches!(
            eval("currency and amount > 1", &ctx),
            Err(ExpressionError::Evaluate(_))
        ));
    }

    #[test]
    fn test_compile_error() {
        assert!(matches!(
            compile_expression("(amount > 3"),
            Err(ExpressionError::Compile(_))
        ));
    }

    #[test]
    fn test_runtime_faults() {
        let ctx = table();

        assert!(matches!(
            eval("unknown_var > 3", &ctx),
            Err(ExpressionError::Evaluate(_))
        ));
        assert!(matches!(
            eval("currency", &ctx),
            Err(ExpressionError::NonNumeric(_))
        ));
    }
}
