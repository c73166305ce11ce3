use serde_json::{Map, Number, Value};

use super::ast::{BinaryOp, Expr, UnaryOp};

/// Whether an unbound identifier is a hard error (conditions, transforms,
/// `state_update.value`) or resolves to JSON `null` (template substitution,
/// where the caller renders `null` as an empty string).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrictMode {
    Strict,
    Lenient,
}

/// The four scope tiers an expression may read, plus the optional `input`
/// binding used by computed-field transforms.
///
/// `this` is expected to already be the caller's merged view of raw state
/// and computed fields (computed wins on name collision) — the evaluator
/// itself is agnostic to where a value in `this` came from.
#[derive(Debug, Clone)]
pub struct Scope {
    this_: Value,
    global: Value,
    inputs: Value,
    loop_: Option<Value>,
    input: Option<Value>,
    locals: Vec<(String, Value)>,
}

impl Scope {
    pub fn new(this_: Value, global: Value, inputs: Value) -> Self {
        Self {
            this_,
            global,
            inputs,
            loop_: None,
            input: None,
            locals: Vec::new(),
        }
    }

    pub fn with_loop(&self, loop_value: Value) -> Self {
        let mut s = self.clone();
        s.loop_ = Some(loop_value);
        s
    }

    pub fn bind_input(&mut self, value: Value) {
        self.input = Some(value);
    }

    /// Bind an arbitrary bare identifier (e.g. `result`, for a shell
    /// command's captured output) into this scope.
    pub fn bind_named(&mut self, name: impl Into<String>, value: Value) {
        self.locals.push((name.into(), value));
    }

    fn with_local(&self, name: &str, value: Value) -> Self {
        let mut s = self.clone();
        s.locals.push((name.to_string(), value));
        s
    }

    fn resolve_base(&self, name: &str) -> Option<Value> {
        if let Some((_, v)) = self.locals.iter().rev().find(|(n, _)| n == name) {
            return Some(v.clone());
        }
        match name {
            "this" | "state" => Some(self.this_.clone()),
            "global" => Some(self.global.clone()),
            "inputs" | "raw" => Some(self.inputs.clone()),
            "loop" => self.loop_.clone(),
            "input" => self.input.clone(),
            _ => None,
        }
    }

    fn is_reserved_root(name: &str) -> bool {
        matches!(
            name,
            "this" | "state" | "global" | "inputs" | "raw" | "loop" | "input"
        )
    }
}

type EvalResult = Result<Value, String>;

pub fn eval(expr: &Expr, scope: &Scope, strict: StrictMode) -> EvalResult {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Path(segs) => resolve_path(segs, scope, strict),
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, scope, strict)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Object(fields) => {
            let mut map = Map::new();
            for (key, value) in fields {
                map.insert(key.clone(), eval(value, scope, strict)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Unary(op, inner) => {
            let v = eval(inner, scope, strict)?;
            eval_unary(*op, v)
        }
        Expr::Binary(left, BinaryOp::And, right) => {
            let l = eval(left, scope, strict)?;
            if truthy(&l) {
                eval(right, scope, strict)
            } else {
                Ok(l)
            }
        }
        Expr::Binary(left, BinaryOp::Or, right) => {
            let l = eval(left, scope, strict)?;
            if truthy(&l) {
                Ok(l)
            } else {
                eval(right, scope, strict)
            }
        }
        Expr::Binary(left, BinaryOp::Nullish, right) => {
            let l = eval(left, scope, strict)?;
            if l.is_null() {
                eval(right, scope, strict)
            } else {
                Ok(l)
            }
        }
        Expr::Binary(left, op, right) => {
            let l = eval(left, scope, strict)?;
            let r = eval(right, scope, strict)?;
            eval_binary(*op, l, r)
        }
        Expr::Ternary(cond, then_e, else_e) => {
            if truthy(&eval(cond, scope, strict)?) {
                eval(then_e, scope, strict)
            } else {
                eval(else_e, scope, strict)
            }
        }
        Expr::Index(target, index) => {
            let t = eval(target, scope, strict)?;
            let i = eval(index, scope, strict)?;
            index_value(&t, &i, strict)
        }
        Expr::Member(target, name) => {
            let t = eval(target, scope, strict)?;
            member_value(&t, name, strict)
        }
        Expr::Lambda(..) => {
            Err("lambda expressions are only valid as arguments to a higher-order method".into())
        }
        Expr::Call(callee, args) => eval_call(callee, args, scope, strict),
    }
}

fn resolve_path(segs: &[String], scope: &Scope, strict: StrictMode) -> EvalResult {
    let root = segs[0].as_str();
    if root == "loop" && scope.loop_.is_none() {
        return Err("'loop' is not bound outside of a loop scope".to_string());
    }
    let Some(mut value) = scope.resolve_base(root) else {
        return unbound(root, strict);
    };
    for seg in &segs[1..] {
        value = match navigate(&value, seg) {
            Some(v) => v,
            None => return unbound(&segs.join("."), strict),
        };
    }
    Ok(value)
}

fn navigate(value: &Value, key: &str) -> Option<Value> {
    match value {
        Value::Object(map) => map.get(key).cloned(),
        Value::Array(arr) if key == "length" => Some(Value::from(arr.len())),
        Value::String(s) if key == "length" => Some(Value::from(s.chars().count())),
        _ => None,
    }
}

fn unbound(name: &str, strict: StrictMode) -> EvalResult {
    match strict {
        StrictMode::Strict => Err(format!("unbound identifier '{name}'")),
        StrictMode::Lenient => Ok(Value::Null),
    }
}

fn member_value(target: &Value, name: &str, strict: StrictMode) -> EvalResult {
    match navigate(target, name) {
        Some(v) => Ok(v),
        None => unbound(name, strict),
    }
}

fn index_value(target: &Value, index: &Value, strict: StrictMode) -> EvalResult {
    match (target, index) {
        (Value::Array(arr), Value::Number(n)) => {
            let i = n.as_i64().unwrap_or(-1);
            if i >= 0 {
                if let Some(v) = arr.get(i as usize) {
                    return Ok(v.clone());
                }
            }
            unbound(&format!("[{i}]"), strict)
        }
        (Value::Object(map), Value::String(s)) => match map.get(s) {
            Some(v) => Ok(v.clone()),
            None => unbound(s, strict),
        },
        _ => Err("index target/operand type mismatch".to_string()),
    }
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_f64(v: &Value) -> Result<f64, String> {
    v.as_f64().ok_or_else(|| format!("expected a number, got {v}"))
}

fn as_str(v: &Value) -> Result<&str, String> {
    v.as_str().ok_or_else(|| format!("expected a string, got {v}"))
}

fn eval_unary(op: UnaryOp, v: Value) -> EvalResult {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
        UnaryOp::Neg => Ok(num(-as_f64(&v)?)),
        UnaryOp::Pos => Ok(num(as_f64(&v)?)),
    }
}

fn num(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn eval_binary(op: BinaryOp, l: Value, r: Value) -> EvalResult {
    use BinaryOp::*;
    match op {
        Add => {
            if matches!(l, Value::String(_)) || matches!(r, Value::String(_)) {
                Ok(Value::String(format!("{}{}", display(&l), display(&r))))
            } else {
                Ok(num(as_f64(&l)? + as_f64(&r)?))
            }
        }
        Sub => Ok(num(as_f64(&l)? - as_f64(&r)?)),
        Mul => Ok(num(as_f64(&l)? * as_f64(&r)?)),
        Div => Ok(num(as_f64(&l)? / as_f64(&r)?)),
        Mod => Ok(num(as_f64(&l)? % as_f64(&r)?)),
        Eq => Ok(Value::Bool(l == r)),
        NotEq => Ok(Value::Bool(l != r)),
        Lt | Lte | Gt | Gte => compare(op, &l, &r),
        And | Or | Nullish => unreachable!("short-circuit operators handled in eval()"),
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> EvalResult {
    use std::cmp::Ordering;
    let ordering = match (l, r) {
        (Value::Number(_), Value::Number(_)) => {
            as_f64(l)?.partial_cmp(&as_f64(r)?).ok_or("NaN comparison")?
        }
        (Value::String(_), Value::String(_)) => as_str(l)?.cmp(as_str(r)?).into(),
        _ => return Err("relational operator type mismatch".to_string()),
    };
    let b = match op {
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Lte => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Gte => ordering != Ordering::Less,
        _ => unreachable!(),
    };
    Ok(Value::Bool(b))
}

fn display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Calls: bare builtins, namespace functions, and receiver methods.
// ---------------------------------------------------------------------------

fn eval_call(callee: &Expr, args: &[Expr], scope: &Scope, strict: StrictMode) -> EvalResult {
    match callee {
        Expr::Path(segs) if segs.len() >= 2 && matches!(segs[0].as_str(), "Math" | "JSON" | "Object") => {
            let vals = eval_args(args, scope, strict)?;
            namespace_call(&segs[0], &segs[1], &vals)
        }
        Expr::Path(segs) if segs.len() == 1 && matches!(segs[0].as_str(), "now" | "uuid") => {
            bare_builtin(&segs[0])
        }
        Expr::Path(segs) if segs.len() >= 2 && (Scope::is_reserved_root(&segs[0]) || scope.resolve_base(&segs[0]).is_some()) => {
            let base_segs = &segs[..segs.len() - 1];
            let method = segs.last().unwrap();
            let receiver = resolve_path(base_segs, scope, strict)?;
            dispatch_method(&receiver, method, args, scope, strict)
        }
        Expr::Path(segs) if segs.len() == 1 => Err(format!("unknown function '{}'", segs[0])),
        other => {
            let receiver_expr_members = as_member(other)?;
            let (target_expr, method) = receiver_expr_members;
            let receiver = eval(target_expr, scope, strict)?;
            dispatch_method(&receiver, method, args, scope, strict)
        }
    }
}

fn as_member(expr: &Expr) -> Result<(&Expr, &str), String> {
    match expr {
        Expr::Member(target, name) => Ok((target.as_ref(), name.as_str())),
        _ => Err("expression is not callable".to_string()),
    }
}

fn eval_args(args: &[Expr], scope: &Scope, strict: StrictMode) -> Result<Vec<Value>, String> {
    args.iter().map(|a| eval(a, scope, strict)).collect()
}

fn bare_builtin(name: &str) -> EvalResult {
    match name {
        "now" => Ok(Value::String(chrono::Utc::now().to_rfc3339())),
        "uuid" => Ok(Value::String(uuid::Uuid::new_v4().to_string())),
        other => Err(format!("unknown function '{other}'")),
    }
}

fn namespace_call(namespace: &str, method: &str, args: &[Value]) -> EvalResult {
    match (namespace, method) {
        ("Math", "max") => nums(args)?.into_iter().reduce(f64::max).map(num).ok_or_else(|| "Math.max requires at least one argument".into()),
        ("Math", "min") => nums(args)?.into_iter().reduce(f64::min).map(num).ok_or_else(|| "Math.min requires at least one argument".into()),
        ("Math", "abs") => Ok(num(as_f64(one(args)?)?.abs())),
        ("Math", "floor") => Ok(num(as_f64(one(args)?)?.floor())),
        ("Math", "ceil") => Ok(num(as_f64(one(args)?)?.ceil())),
        ("Math", "round") => Ok(num(as_f64(one(args)?)?.round())),
        ("Math", "pow") => Ok(num(as_f64(&args[0])?.powf(as_f64(&args[1])?))),
        ("Math", "sqrt") => Ok(num(as_f64(one(args)?)?.sqrt())),
        ("JSON", "parse") => {
            let s = as_str(one(args)?)?;
            serde_json::from_str(s).map_err(|e| format!("JSON.parse failed: {e}"))
        }
        ("JSON", "stringify") => {
            serde_json::to_string(one(args)?).map(Value::String).map_err(|e| format!("JSON.stringify failed: {e}"))
        }
        ("Object", "keys") => {
            let map = as_object(one(args)?)?;
            Ok(Value::Array(map.keys().map(|k| Value::String(k.clone())).collect()))
        }
        ("Object", "values") => {
            let map = as_object(one(args)?)?;
            Ok(Value::Array(map.values().cloned().collect()))
        }
        ("Object", "entries") => {
            let map = as_object(one(args)?)?;
            Ok(Value::Array(
                map.iter()
                    .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                    .collect(),
            ))
        }
        (ns, m) => Err(format!("unknown function '{ns}.{m}'")),
    }
}

fn one(args: &[Value]) -> Result<&Value, String> {
    args.first().ok_or_else(|| "expected one argument".to_string())
}

fn nums(args: &[Value]) -> Result<Vec<f64>, String> {
    args.iter().map(as_f64).collect()
}

fn as_object(v: &Value) -> Result<&Map<String, Value>, String> {
    v.as_object().ok_or_else(|| format!("expected an object, got {v}"))
}

/// Dispatch a method call on an already-evaluated receiver value. `args` are
/// the raw, unevaluated argument expressions so a lambda argument can be
/// applied per-element by the higher-order methods below.
fn dispatch_method(
    receiver: &Value,
    method: &str,
    args: &[Expr],
    scope: &Scope,
    strict: StrictMode,
) -> EvalResult {
    match receiver {
        Value::Array(arr) => array_method(arr, method, args, scope, strict),
        Value::String(s) => string_method(s, method, args, scope, strict),
        other => Err(format!("'{method}' is not a method of {other}")),
    }
}

fn apply_lambda(lambda: &Expr, call_args: Vec<Value>, scope: &Scope, strict: StrictMode) -> EvalResult {
    let Expr::Lambda(params, body) = lambda else {
        return Err("expected a lambda expression as this argument".to_string());
    };
    let mut local_scope = scope.clone();
    for (i, param) in params.iter().enumerate() {
        let value = call_args.get(i).cloned().unwrap_or(Value::Null);
        local_scope = local_scope.with_local(param, value);
    }
    eval(body, &local_scope, strict)
}

fn array_method(
    arr: &[Value],
    method: &str,
    args: &[Expr],
    scope: &Scope,
    strict: StrictMode,
) -> EvalResult {
    match method {
        "map" => {
            let lambda = args.first().ok_or("map requires a lambda argument")?;
            let mut out = Vec::with_capacity(arr.len());
            for (i, item) in arr.iter().enumerate() {
                out.push(apply_lambda(lambda, vec![item.clone(), num(i as f64)], scope, strict)?);
            }
            Ok(Value::Array(out))
        }
        "filter" => {
            let lambda = args.first().ok_or("filter requires a lambda argument")?;
            let mut out = Vec::new();
            for (i, item) in arr.iter().enumerate() {
                let keep = apply_lambda(lambda, vec![item.clone(), num(i as f64)], scope, strict)?;
                if truthy(&keep) {
                    out.push(item.clone());
                }
            }
            Ok(Value::Array(out))
        }
        "reduce" => {
            let lambda = args.first().ok_or("reduce requires a lambda argument")?;
            let mut acc = match args.get(1) {
                Some(init_expr) => eval(init_expr, scope, strict)?,
                None => arr.first().cloned().ok_or("reduce of empty array with no initial value")?,
            };
            let start = if args.len() > 1 { 0 } else { 1 };
            for (i, item) in arr.iter().enumerate().skip(start) {
                acc = apply_lambda(lambda, vec![acc, item.clone(), num(i as f64)], scope, strict)?;
            }
            Ok(acc)
        }
        "some" => {
            let lambda = args.first().ok_or("some requires a lambda argument")?;
            for (i, item) in arr.iter().enumerate() {
                let v = apply_lambda(lambda, vec![item.clone(), num(i as f64)], scope, strict)?;
                if truthy(&v) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "every" => {
            let lambda = args.first().ok_or("every requires a lambda argument")?;
            for (i, item) in arr.iter().enumerate() {
                let v = apply_lambda(lambda, vec![item.clone(), num(i as f64)], scope, strict)?;
                if !truthy(&v) {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        "slice" => {
            let start = match args.first() {
                Some(e) => as_f64(&eval(e, scope, strict)?)? as i64,
                None => 0,
            };
            let len = arr.len() as i64;
            let start = start.clamp(0, len) as usize;
            let end = match args.get(1) {
                Some(e) => as_f64(&eval(e, scope, strict)?)? as i64,
                None => len,
            }
            .clamp(0, len) as usize;
            Ok(Value::Array(arr.get(start..end.max(start)).unwrap_or(&[]).to_vec()))
        }
        "includes" => {
            let needle = eval(args.first().ok_or("includes requires an argument")?, scope, strict)?;
            Ok(Value::Bool(arr.iter().any(|v| v == &needle)))
        }
        "sort" => {
            let mut sorted = arr.to_vec();
            if let Some(lambda) = args.first() {
                let mut err: Option<String> = None;
                sorted.sort_by(|a, b| {
                    if err.is_some() {
                        return std::cmp::Ordering::Equal;
                    }
                    match apply_lambda(lambda, vec![a.clone(), b.clone()], scope, strict)
                        .and_then(|v| as_f64(&v))
                    {
                        Ok(f) => f.partial_cmp(&0.0).unwrap_or(std::cmp::Ordering::Equal),
                        Err(e) => {
                            err = Some(e);
                            std::cmp::Ordering::Equal
                        }
                    }
                });
                if let Some(e) = err {
                    return Err(e);
                }
            } else {
                sorted.sort_by(|a, b| match (a, b) {
                    (Value::Number(x), Value::Number(y)) => {
                        x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(std::cmp::Ordering::Equal)
                    }
                    (Value::String(x), Value::String(y)) => x.cmp(y),
                    _ => std::cmp::Ordering::Equal,
                });
            }
            Ok(Value::Array(sorted))
        }
        "join" => {
            let sep = match args.first() {
                Some(e) => display(&eval(e, scope, strict)?),
                None => ",".to_string(),
            };
            Ok(Value::String(arr.iter().map(display).collect::<Vec<_>>().join(&sep)))
        }
        other => Err(format!("unknown array method '{other}'")),
    }
}

fn string_method(
    s: &str,
    method: &str,
    args: &[Expr],
    scope: &Scope,
    strict: StrictMode,
) -> EvalResult {
    let arg_str = |i: usize| -> Result<String, String> {
        let e = args.get(i).ok_or_else(|| format!("{method} requires argument {i}"))?;
        Ok(display(&eval(e, scope, strict)?))
    };
    match method {
        "includes" => Ok(Value::Bool(s.contains(&arg_str(0)?))),
        "split" => Ok(Value::Array(
            s.split(&arg_str(0)?).map(|part| Value::String(part.to_string())).collect(),
        )),
        "toUpperCase" => Ok(Value::String(s.to_uppercase())),
        "toLowerCase" => Ok(Value::String(s.to_lowercase())),
        "trim" => Ok(Value::String(s.trim().to_string())),
        "replace" => {
            let search = arg_str(0)?;
            let replacement = arg_str(1)?;
            Ok(Value::String(s.replacen(&search, &replacement, 1)))
        }
        "startsWith" => Ok(Value::Bool(s.starts_with(&arg_str(0)?))),
        "endsWith" => Ok(Value::Bool(s.ends_with(&arg_str(0)?))),
        "slice" => {
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len() as i64;
            let start = match args.first() {
                Some(e) => as_f64(&eval(e, scope, strict)?)? as i64,
                None => 0,
            }
            .clamp(0, len) as usize;
            let end = match args.get(1) {
                Some(e) => as_f64(&eval(e, scope, strict)?)? as i64,
                None => len,
            }
            .clamp(0, len) as usize;
            Ok(Value::String(chars.get(start..end.max(start)).unwrap_or(&[]).iter().collect()))
        }
        other => Err(format!("unknown string method '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{evaluate, parse_only};
    use serde_json::json;

    #[test]
    fn reduce_without_initial_sums_array() {
        let scope = Scope::new(json!({"nums": [1, 2, 3, 4]}), json!({}), json!({}));
        let v = evaluate("this.nums.reduce((a,b) => a + b)", &scope, StrictMode::Strict).unwrap();
        assert_eq!(v, json!(10));
    }

    #[test]
    fn sort_with_comparator() {
        let scope = Scope::new(json!({"nums": [3, 1, 2]}), json!({}), json!({}));
        let v = evaluate("this.nums.sort((a,b) => a - b)", &scope, StrictMode::Strict).unwrap();
        assert_eq!(v, json!([1, 2, 3]));
    }

    #[test]
    fn parse_only_validates_syntax() {
        assert!(parse_only("this.x +").is_err());
        assert!(parse_only("this.x + 1").is_ok());
    }
}
