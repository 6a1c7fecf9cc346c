//! Local reuse exclusion patterns

/// Names that must never be reused from the local store under the sharing
/// modes. `com.acme.Task` matches by prefix; `com.acme.*` matches any name
/// starting with `com.acme.`.
#[derive(Debug, Clone, Default)]
pub struct LocalExclusions {
    prefixes: Vec<String>,
}

impl LocalExclusions {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefixes = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref().trim();
                p.strip_suffix('*').unwrap_or(p).to_string()
            })
            .filter(|p| !p.is_empty())
            .collect();
        Self { prefixes }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    /// True if either the alias or the class name is excluded
    pub fn excludes(&self, alias: &str, class_name: &str) -> bool {
        self.matches(alias) || self.matches(class_name)
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_wildcard_patterns() {
        let exclusions = LocalExclusions::new(["org.acme.*", "Task1"]);

        assert!(exclusions.matches("org.acme.Job"));
        assert!(exclusions.matches("Task1"));
        assert!(exclusions.matches("Task1Helper"));
        assert!(!exclusions.matches("org.other.Job"));
        assert!(exclusions.excludes("alias", "org.acme.Job"));
        assert!(!exclusions.excludes("alias", "Task2"));
    }

    #[test]
    fn test_bare_wildcard_is_ignored() {
        let exclusions = LocalExclusions::new(["*", " "]);
        assert!(exclusions.is_empty());
        assert!(!exclusions.matches("Task1"));
    }
}
