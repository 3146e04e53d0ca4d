//! Scope guard: dispatch-induced file changes must stay inside a step's
//! declared allowed path set.

use glob::Pattern;
use thiserror::Error;

/// Invalid scope policy inputs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("{name} must be a non-empty string")]
    EmptyEntry { name: String },

    #[error("{name} must be a relative path: {path}")]
    AbsolutePath { name: String, path: String },

    #[error("{name} cannot contain parent traversal: {path}")]
    ParentTraversal { name: String, path: String },

    #[error("{name} must contain at least one path segment")]
    NoSegments { name: String },

    #[error("allowed_scope must contain at least one entry")]
    EmptyScope,

    #[error("invalid glob pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Outcome of auditing a set of changed files against an allowed scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeAudit {
    pub allowed_scope: Vec<String>,
    pub violating_files: Vec<String>,
}

impl ScopeAudit {
    pub fn passed(&self) -> bool {
        self.violating_files.is_empty()
    }
}

/// Normalize a changed-file path: forward slashes, no empty or `.`
/// segments, no absolute paths, no parent traversal.
pub fn normalize_relative_path(path: &str, name: &str) -> Result<String, ScopeError> {
    let raw = path.trim();
    if raw.is_empty() {
        return Err(ScopeError::EmptyEntry {
            name: name.to_string(),
        });
    }
    let replaced = raw.replace('\\', "/");
    if replaced.starts_with('/') {
        return Err(ScopeError::AbsolutePath {
            name: name.to_string(),
            path: path.to_string(),
        });
    }
    let mut segments: Vec<&str> = Vec::new();
    for part in replaced.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(ScopeError::ParentTraversal {
                    name: name.to_string(),
                    path: path.to_string(),
                })
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(ScopeError::NoSegments {
            name: name.to_string(),
        });
    }
    Ok(segments.join("/"))
}

/// Normalize one allowed-scope entry, preserving a trailing `/` which marks
/// a directory prefix rather than a glob.
fn normalize_scope_entry(entry: &str, name: &str) -> Result<String, ScopeError> {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return Err(ScopeError::EmptyEntry {
            name: name.to_string(),
        });
    }
    let is_directory = trimmed.ends_with('/');
    // Glob metacharacters survive segment normalization untouched.
    let normalized = normalize_relative_path(trimmed, name)?;
    if is_directory {
        Ok(format!("{normalized}/"))
    } else {
        Ok(normalized)
    }
}

/// Normalize and de-duplicate an allowed scope.
pub fn normalize_scope(allowed_scope: &[String]) -> Result<Vec<String>, ScopeError> {
    let mut normalized = Vec::with_capacity(allowed_scope.len());
    let mut seen = std::collections::BTreeSet::new();
    for (index, entry) in allowed_scope.iter().enumerate() {
        let item = normalize_scope_entry(entry, &format!("allowed_scope[{index}]"))?;
        if seen.insert(item.clone()) {
            normalized.push(item);
        }
    }
    if normalized.is_empty() {
        return Err(ScopeError::EmptyScope);
    }
    Ok(normalized)
}

fn matches_scope(path: &str, entry: &str) -> Result<bool, ScopeError> {
    if let Some(prefix) = entry.strip_suffix('/') {
        return Ok(path == prefix || path.starts_with(&format!("{prefix}/")));
    }
    if entry.contains('*') || entry.contains('?') || entry.contains('[') {
        let pattern = Pattern::new(entry).map_err(|glob_error| ScopeError::InvalidPattern {
            pattern: entry.to_string(),
            message: glob_error.to_string(),
        })?;
        return Ok(pattern.matches(path));
    }
    Ok(path == entry || path.starts_with(&format!("{entry}/")))
}

/// Audit changed files against an allowed scope.
pub fn audit_changed_files(
    changed_files: &[String],
    allowed_scope: &[String],
) -> Result<ScopeAudit, ScopeError> {
    let scope = normalize_scope(allowed_scope)?;
    let mut violating = Vec::new();
    for (index, changed) in changed_files.iter().enumerate() {
        let path = normalize_relative_path(changed, &format!("changed_files[{index}]"))?;
        let mut allowed = false;
        for entry in &scope {
            if matches_scope(&path, entry)? {
                allowed = true;
                break;
            }
        }
        if !allowed {
            violating.push(path);
        }
    }
    Ok(ScopeAudit {
        allowed_scope: scope,
        violating_files: violating,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn glob_scope_matches_nested_files() {
        let audit = audit_changed_files(
            &strings(&["src/foo/a.py", "src/foo/deep/b.py", "src/bar/b.py"]),
            &strings(&["src/foo/**"]),
        )
        .unwrap();
        assert!(!audit.passed());
        assert_eq!(audit.violating_files, vec!["src/bar/b.py"]);
    }

    #[test]
    fn directory_suffix_entries_match_by_prefix() {
        let audit = audit_changed_files(
            &strings(&["docs/guide.md", "docs/sub/page.md", "src/lib.rs"]),
            &strings(&["docs/"]),
        )
        .unwrap();
        assert_eq!(audit.violating_files, vec!["src/lib.rs"]);
    }

    #[test]
    fn plain_entries_match_exact_or_subtree() {
        let audit = audit_changed_files(
            &strings(&["src/foo", "src/foo/inner.rs", "src/foobar.rs"]),
            &strings(&["src/foo"]),
        )
        .unwrap();
        assert_eq!(audit.violating_files, vec!["src/foobar.rs"]);
    }

    #[test]
    fn changed_paths_are_normalized_before_matching() {
        let audit = audit_changed_files(
            &strings(&["src/./foo/a.py", "src\\foo\\b.py"]),
            &strings(&["src/foo/**"]),
        )
        .unwrap();
        assert!(audit.passed());
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let err = audit_changed_files(&strings(&["../escape.rs"]), &strings(&["src/**"]))
            .unwrap_err();
        assert!(matches!(err, ScopeError::ParentTraversal { .. }));
    }

    #[test]
    fn absolute_paths_are_rejected() {
        let err =
            audit_changed_files(&strings(&["/etc/passwd"]), &strings(&["src/**"])).unwrap_err();
        assert!(matches!(err, ScopeError::AbsolutePath { .. }));
    }

    #[test]
    fn empty_scope_is_rejected() {
        let err = audit_changed_files(&strings(&["src/a.rs"]), &[]).unwrap_err();
        assert_eq!(err, ScopeError::EmptyScope);
    }
}
