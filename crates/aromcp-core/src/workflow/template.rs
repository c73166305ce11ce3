//! `{{ expr }}` template substitution, performed exactly once at atomic
//! step emission time (spec §4.D, "Variable substitution").

use serde_json::Value;

use crate::expr::{self, Scope, StrictMode};

/// Render all `{{ expr }}` segments in `template` against `scope`. Missing
/// variables resolve to the empty string (lenient mode); nested `{{ }}` and
/// partial escaping are not supported, matching spec.md §9.
pub fn render(template: &str, scope: &Scope) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            // Unterminated `{{`: emit it verbatim and stop scanning.
            out.push_str(&rest[start..]);
            return out;
        };
        let expr_src = after_open[..end].trim();
        let value = expr::evaluate(expr_src, scope, StrictMode::Lenient).unwrap_or(Value::Null);
        out.push_str(&stringify(&value));
        rest = &after_open[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Stringify a value the way template rendering and string concatenation
/// do: `null` as the empty string, strings bare, everything else as JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// True if `s` still contains an unresolved `{{` — used by tests/invariant
/// checks (spec §8 invariant 3).
pub fn has_unresolved_placeholder(s: &str) -> bool {
    s.contains("{{")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_single_expression() {
        let scope = Scope::new(json!({"counter": 5}), json!({}), json!({}));
        assert_eq!(render("Counter is {{ this.counter }}", &scope), "Counter is 5");
    }

    #[test]
    fn missing_variable_becomes_empty_string() {
        let scope = Scope::new(json!({}), json!({}), json!({}));
        assert_eq!(render("[{{ this.missing }}]", &scope), "[]");
    }

    #[test]
    fn multiple_segments() {
        let scope = Scope::new(json!({}), json!({}), json!({}));
        let s = scope.with_loop(json!({"item": "a.ts", "index": 0}));
        assert_eq!(render("{{ loop.item }}@{{ loop.index }}", &s), "a.ts@0");
    }

    #[test]
    fn no_placeholders_left_after_render() {
        let scope = Scope::new(json!({"x": 1}), json!({}), json!({}));
        let rendered = render("value={{ this.x }}", &scope);
        assert!(!has_unresolved_placeholder(&rendered));
    }
}
