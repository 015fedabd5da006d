//! Deterministic scope-path enforcement (C7 step 5). Runs with no model
//! call: a `ScopeContract`'s `in_scope` entries that look like file paths
//! bound what `implementer.patch_scope` is allowed to touch.

use sa_domain::pipeline_schemas::{MustFixItem, Severity};

const PATH_EXTENSIONS: &[&str] = &[".py", ".ts", ".tsx", ".md", ".yml", ".yaml", ".json"];

/// `in_scope` is file-path-constrained iff at least one entry looks like a
/// path (contains `/` or ends in a recognized source extension).
pub fn has_path_constraints(in_scope: &[String]) -> bool {
    in_scope.iter().any(|s| looks_like_path(s))
}

fn looks_like_path(s: &str) -> bool {
    s.contains('/') || PATH_EXTENSIONS.iter().any(|ext| s.ends_with(ext))
}

/// Strips a leading `./`, collapses repeated `/`, and turns `\` into `/`.
pub fn normalize_path(raw: &str) -> String {
    let slashed = raw.replace('\\', "/");
    let stripped = slashed.strip_prefix("./").unwrap_or(&slashed);
    let mut normalized = String::with_capacity(stripped.len());
    let mut last_was_slash = false;
    for c in stripped.chars() {
        if c == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        normalized.push(c);
    }
    normalized
}

pub struct ScopeViolation {
    pub must_fix: Vec<MustFixItem>,
}

/// Checks `patch_scope` against the path-like subset of `in_scope`. Returns
/// `None` when `in_scope` carries no path constraints (nothing to enforce)
/// or when `patch_scope` is a non-empty subset of the allowed set.
pub fn check_scope(in_scope: &[String], patch_scope: &[String]) -> Option<ScopeViolation> {
    if !has_path_constraints(in_scope) {
        return None;
    }

    let allowed: std::collections::HashSet<String> =
        in_scope.iter().filter(|s| looks_like_path(s)).map(|s| normalize_path(s)).collect();

    if patch_scope.is_empty() {
        return Some(ScopeViolation {
            must_fix: vec![MustFixItem {
                severity: Severity::High,
                file: String::new(),
                issue: "implementer.patch_scope is empty but in_scope declares file paths".to_string(),
                suggested_fix: "patch_scope must list every file the implementation touches".to_string(),
            }],
        });
    }

    let mut must_fix = Vec::new();
    for path in patch_scope {
        let normalized = normalize_path(path);
        if !allowed.contains(&normalized) {
            must_fix.push(MustFixItem {
                severity: Severity::High,
                file: path.clone(),
                issue: "file is outside the scope contract's in_scope paths".to_string(),
                suggested_fix: "remove this file from patch_scope or add it to in_scope".to_string(),
            });
        }
    }

    if must_fix.is_empty() {
        None
    } else {
        Some(ScopeViolation { must_fix })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_path_constraints_never_violates() {
        assert!(check_scope(&["improve error messages".to_string()], &[]).is_none());
    }

    #[test]
    fn subset_patch_scope_passes() {
        let in_scope = vec!["backend/src/foo.py".to_string()];
        let patch_scope = vec!["backend/src/foo.py".to_string()];
        assert!(check_scope(&in_scope, &patch_scope).is_none());
    }

    #[test]
    fn extra_file_outside_scope_violates() {
        let in_scope = vec!["backend/src/foo.py".to_string()];
        let patch_scope = vec!["backend/src/foo.py".to_string(), "backend/src/bar.py".to_string()];
        let violation = check_scope(&in_scope, &patch_scope).unwrap();
        assert_eq!(violation.must_fix.len(), 1);
        assert_eq!(violation.must_fix[0].file, "backend/src/bar.py");
    }

    #[test]
    fn empty_patch_scope_violates_when_paths_declared() {
        let in_scope = vec!["backend/src/foo.py".to_string()];
        let violation = check_scope(&in_scope, &[]).unwrap();
        assert_eq!(violation.must_fix.len(), 1);
    }

    #[test]
    fn normalize_path_strips_dot_slash_and_collapses_double_slash() {
        assert_eq!(normalize_path("./backend//src/foo.py"), "backend/src/foo.py");
        assert_eq!(normalize_path("backend\\src\\foo.py"), "backend/src/foo.py");
    }

    #[test]
    fn looks_like_path_matches_recognized_extensions_without_slash() {
        assert!(has_path_constraints(&["README.md".to_string()]));
        assert!(!has_path_constraints(&["keep comments terse".to_string()]));
    }
}
