//! Parsing of scoped variable paths (`this.x`, `global.y`, `inputs.z`, ...)
//! shared by the State Store, the loader's structural validation, and the
//! interpreter's `state_update` handling.

use crate::error::EngineError;

/// Which tier a scoped path resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRoot {
    This,
    Global,
    Inputs,
    Computed,
    Loop,
}

/// Split a dotted scoped path into its root and remaining segments,
/// mapping the legacy aliases documented in DESIGN.md:
/// `state.*` -> `this.*`, `raw.*` -> `inputs.*` (read-only), `computed.*`
/// stays a distinct (read-only) root.
///
/// Returns `(root, segments, used_legacy_alias)`.
pub fn parse_scope_path(path: &str) -> Result<(ScopeRoot, Vec<String>, bool), EngineError> {
    let mut parts = path.split('.');
    let root_word = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::StateWrite(format!("empty scoped path '{path}'")))?;
    let rest: Vec<String> = parts.map(|s| s.to_string()).collect();

    let (root, legacy) = match root_word {
        "this" => (ScopeRoot::This, false),
        "global" => (ScopeRoot::Global, false),
        "inputs" => (ScopeRoot::Inputs, false),
        "loop" => (ScopeRoot::Loop, false),
        "computed" => (ScopeRoot::Computed, false),
        "state" => (ScopeRoot::This, true),
        "raw" => (ScopeRoot::Inputs, true),
        other => {
            return Err(EngineError::StateWrite(format!(
                "path '{path}' does not start with a valid scope (this/global/inputs/loop), got '{other}'"
            )))
        }
    };

    if rest.is_empty() {
        return Err(EngineError::StateWrite(format!(
            "scoped path '{path}' has no field after the scope prefix"
        )));
    }

    Ok((root, rest, legacy))
}

/// True if `root` may be the target of a `state_update` write.
pub fn is_writable(root: ScopeRoot) -> bool {
    matches!(root, ScopeRoot::This | ScopeRoot::Global)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_roots() {
        let (root, segs, legacy) = parse_scope_path("this.counter").unwrap();
        assert_eq!(root, ScopeRoot::This);
        assert_eq!(segs, vec!["counter".to_string()]);
        assert!(!legacy);
    }

    #[test]
    fn maps_legacy_state_to_this() {
        let (root, _, legacy) = parse_scope_path("state.counter").unwrap();
        assert_eq!(root, ScopeRoot::This);
        assert!(legacy);
    }

    #[test]
    fn maps_legacy_raw_to_inputs() {
        let (root, _, legacy) = parse_scope_path("raw.files").unwrap();
        assert_eq!(root, ScopeRoot::Inputs);
        assert!(legacy);
    }

    #[test]
    fn rejects_unknown_root() {
        assert!(parse_scope_path("bogus.x").is_err());
    }

    #[test]
    fn rejects_bare_root_with_no_field() {
        assert!(parse_scope_path("this").is_err());
    }

    #[test]
    fn writable_roots() {
        assert!(is_writable(ScopeRoot::This));
        assert!(is_writable(ScopeRoot::Global));
        assert!(!is_writable(ScopeRoot::Inputs));
        assert!(!is_writable(ScopeRoot::Computed));
    }
}
