//! Restricted JavaScript-like expression language.
//!
//! Used for step conditions, computed-field transforms, and `{{ }}` template
//! substitution. The supported subset is arithmetic, comparison, logical and
//! nullish operators, property/index access, array/object literals, the
//! ternary operator, and calls to a small whitelist of built-in functions and
//! methods (with lambdas accepted only as arguments to those methods).
//!
//! There is no embedded JS engine dependency here — a small recursive-descent
//! parser over the documented subset is sufficient and keeps the crate's
//! dependency stack aligned with its host (no JS-engine crate is carried).

mod ast;
mod eval;
mod lexer;
mod parser;

pub use ast::Expr;
pub use eval::{truthy, Scope, StrictMode};

use crate::error::{EngineError, Result};

/// Parse and evaluate `source` against `scope` in one shot.
///
/// `strict` controls whether an unbound identifier is an error (used for
/// conditions/transforms) or resolves to JSON `null` (used for template
/// substitution, per the spec's "missing variables resolve to the empty
/// string" rule — the caller is responsible for stringifying `null` as `""`).
pub fn evaluate(source: &str, scope: &Scope, strict: StrictMode) -> Result<serde_json::Value> {
    let tokens = lexer::tokenize(source)
        .map_err(|cause| EngineError::expression(source, cause))?;
    let expr = parser::parse(&tokens)
        .map_err(|cause| EngineError::expression(source, cause))?;
    eval::eval(&expr, scope, strict).map_err(|cause| EngineError::expression(source, cause))
}

/// Parse `source` once without evaluating it — used by the loader to
/// validate that conditions/transforms are at least syntactically sound.
pub fn parse_only(source: &str) -> Result<Expr> {
    let tokens = lexer::tokenize(source).map_err(|cause| EngineError::expression(source, cause))?;
    parser::parse(&tokens).map_err(|cause| EngineError::expression(source, cause))
}
