//! Exclusion list
//!
//! Case-insensitive glob patterns (`*` any run, `?` one character) matched
//! against a resource's display name and URL.

use super::model::Resource;

#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    patterns: Vec<String>,
}

impl ExclusionList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn excludes(&self, resource: &Resource) -> bool {
        let name = resource.display_name.to_lowercase();
        let url = resource.url.to_lowercase();
        self.patterns
            .iter()
            .any(|p| glob_match(p, &name) || glob_match(p, &url))
    }
}

/// Iterative wildcard match with single-star backtracking
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::model::ResourceKind;

    fn site(name: &str, url: &str) -> Resource {
        Resource {
            id: name.to_string(),
            display_name: name.to_string(),
            url: url.to_string(),
            kind: ResourceKind::Shared,
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("team-*", "team-alpha"));
        assert!(glob_match("*/sites/archive*", "https://t/sites/archive-2019"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
        assert!(glob_match("*a*b*", "xxaxxbxx"));
        assert!(!glob_match("team-*", "my-team-alpha"));
    }

    #[test]
    fn test_exclusion_matches_name_or_url() {
        let list = ExclusionList::new(["Archive*", "*/sites/test-*"]);
        assert!(list.excludes(&site("archive 2020", "https://t/sites/a")));
        assert!(list.excludes(&site("Sandbox", "https://t/sites/TEST-1")));
        assert!(!list.excludes(&site("Finance", "https://t/sites/finance")));
    }

    #[test]
    fn test_blank_patterns_are_ignored() {
        let list = ExclusionList::new(["", "  "]);
        assert!(list.is_empty());
        assert!(!list.excludes(&site("x", "y")));
    }
}
