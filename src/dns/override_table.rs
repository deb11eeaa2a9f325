//! Static suffix-match table that routes selected zones to an alternate
//! classic-DNS upstream instead of the configured DoH endpoint.

/// A single override rule: queries under `suffix` are resolved against
/// `upstream` using the classic DNS client rather than the DoH client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverrideRule {
    pub suffix: String,
    pub upstream: (String, u16),
}

/// Immutable once loaded; built once at startup from configuration.
#[derive(Clone, Debug, Default)]
pub struct OverrideTable {
    rules: Vec<OverrideRule>,
}

fn labels(name: &str) -> Vec<String> {
    name.trim_end_matches('.')
        .to_lowercase()
        .split('.')
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// True if `suffix_labels` is a label-aligned suffix of `name_labels`, i.e.
/// matching whole labels from the right, not an arbitrary substring.
fn is_suffix_match(name_labels: &[String], suffix_labels: &[String]) -> bool {
    if suffix_labels.len() > name_labels.len() {
        return false;
    }
    let offset = name_labels.len() - suffix_labels.len();
    name_labels[offset..] == suffix_labels[..]
}

impl OverrideTable {
    pub fn new(rules: Vec<OverrideRule>) -> OverrideTable {
        OverrideTable { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the upstream for the longest suffix rule matching `name`, or
    /// `None` if no rule applies. Matching is case-insensitive and
    /// label-aligned (a rule for `example.com` does not match
    /// `notexample.com`).
    pub fn resolve(&self, name: &str) -> Option<(String, u16)> {
        let name_labels = labels(name);

        self.rules
            .iter()
            .filter(|rule| is_suffix_match(&name_labels, &labels(&rule.suffix)))
            .max_by_key(|rule| labels(&rule.suffix).len())
            .map(|rule| rule.upstream.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> OverrideTable {
        OverrideTable::new(vec![
            OverrideRule {
                suffix: "example.com".to_string(),
                upstream: ("10.0.0.1".to_string(), 53),
            },
            OverrideRule {
                suffix: "internal.example.com".to_string(),
                upstream: ("10.0.0.2".to_string(), 53),
            },
        ])
    }

    #[test]
    fn longest_suffix_wins() {
        let t = table();
        assert_eq!(
            t.resolve("host.internal.example.com"),
            Some(("10.0.0.2".to_string(), 53))
        );
        assert_eq!(
            t.resolve("host.example.com"),
            Some(("10.0.0.1".to_string(), 53))
        );
    }

    #[test]
    fn case_insensitive() {
        let t = table();
        assert!(t.resolve("HOST.EXAMPLE.COM").is_some());
    }

    #[test]
    fn label_aligned_not_substring() {
        let t = table();
        assert_eq!(t.resolve("notexample.com"), None);
    }

    #[test]
    fn no_match_returns_none() {
        let t = table();
        assert_eq!(t.resolve("unrelated.net"), None);
    }
}
