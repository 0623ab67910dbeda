//! Qualified tool names and allowlist patterns.
//!
//! A tool is addressed as `"<namespace><DELIMITER><name>"` where the
//! namespace is the upstream id. Allow patterns are dot-separated segment
//! lists whose final segment may be `*`; matching is segment-strict, so
//! `github.*` can never admit `githubenterprise__tool`.

use crate::error::ConduitErr;
use crate::error::Result;

/// Delimiter between the upstream id and the tool name in a qualified name.
/// Chosen from the identifier-safe character set tool-calling models accept.
pub const TOOL_NAME_DELIMITER: &str = "__";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolIdentifier {
    /// Empty for a "bare" identifier that still needs resolution.
    pub namespace: String,
    pub name: String,
}

impl ToolIdentifier {
    pub fn is_bare(&self) -> bool {
        self.namespace.is_empty()
    }

    /// Segment view used by allowlist matching:
    /// `[namespace, ...name split on the delimiter]`.
    fn segments(&self) -> Vec<&str> {
        let name_segments = self.name.split(TOOL_NAME_DELIMITER);
        if self.namespace.is_empty() {
            name_segments.collect()
        } else {
            std::iter::once(self.namespace.as_str())
                .chain(name_segments)
                .collect()
        }
    }
}

/// Split a qualified name at the **first** delimiter. A name without a
/// delimiter parses as bare (empty namespace).
pub fn parse(qualified: &str) -> ToolIdentifier {
    match qualified.split_once(TOOL_NAME_DELIMITER) {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => ToolIdentifier {
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        _ => ToolIdentifier {
            namespace: String::new(),
            name: qualified.to_string(),
        },
    }
}

pub fn format(id: &ToolIdentifier) -> String {
    if id.namespace.is_empty() {
        id.name.clone()
    } else {
        format!("{}{}{}", id.namespace, TOOL_NAME_DELIMITER, id.name)
    }
}

/// A compiled allowlist pattern: literal segments, optionally terminated by
/// a wildcard that prefix-matches the remaining segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowPattern {
    segments: Vec<String>,
    wildcard: bool,
}

impl AllowPattern {
    fn matches(&self, id: &ToolIdentifier) -> bool {
        let tool_segments = id.segments();
        if self.wildcard {
            if tool_segments.len() < self.segments.len() {
                return false;
            }
            self.segments
                .iter()
                .zip(tool_segments.iter())
                .all(|(pat, seg)| pat == seg)
        } else {
            tool_segments.len() == self.segments.len()
                && self
                    .segments
                    .iter()
                    .zip(tool_segments.iter())
                    .all(|(pat, seg)| pat == seg)
        }
    }
}

/// Compile one pattern. Rejected at construction: empty patterns, empty
/// segments, `*` anywhere but the final segment, and the degenerate bare
/// `*` with no preceding named segment.
pub fn compile_pattern(pattern: &str) -> Result<AllowPattern> {
    if pattern.is_empty() {
        return Err(ConduitErr::InvalidParams(
            "allowlist pattern must not be empty".to_string(),
        ));
    }
    let raw: Vec<&str> = pattern.split('.').collect();
    let mut segments = Vec::with_capacity(raw.len());
    let mut wildcard = false;
    for (index, segment) in raw.iter().enumerate() {
        let last = index == raw.len() - 1;
        match *segment {
            "" => {
                return Err(ConduitErr::InvalidParams(format!(
                    "allowlist pattern '{pattern}' contains an empty segment"
                )));
            }
            "*" if last => {
                if index == 0 {
                    return Err(ConduitErr::InvalidParams(
                        "allowlist pattern '*' is not permitted; name at least one segment"
                            .to_string(),
                    ));
                }
                wildcard = true;
            }
            s if s.contains('*') => {
                return Err(ConduitErr::InvalidParams(format!(
                    "allowlist pattern '{pattern}': '*' is only valid as the final segment"
                )));
            }
            s => segments.push(s.to_string()),
        }
    }
    Ok(AllowPattern { segments, wildcard })
}

pub fn compile_patterns(patterns: &[String]) -> Result<Vec<AllowPattern>> {
    patterns.iter().map(|p| compile_pattern(p)).collect()
}

/// `None` means "no restriction"; an empty slice means "nothing allowed".
/// Matching is case-sensitive.
pub fn is_allowed(id: &ToolIdentifier, patterns: Option<&[AllowPattern]>) -> bool {
    match patterns {
        None => true,
        Some(patterns) => patterns.iter().any(|p| p.matches(id)),
    }
}

/// Convenience over raw pattern strings, used where the caller has not
/// pre-compiled (pattern errors count as non-matches since the patterns
/// were validated when the execution was admitted).
pub fn is_allowed_by(id: &ToolIdentifier, patterns: Option<&[String]>) -> bool {
    match patterns {
        None => true,
        Some(raw) => match compile_patterns(raw) {
            Ok(compiled) => is_allowed(id, Some(&compiled)),
            Err(_) => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_splits_at_first_delimiter() {
        let id = parse("github__repos__list");
        assert_eq!(id.namespace, "github");
        assert_eq!(id.name, "repos__list");
    }

    #[test]
    fn parse_without_delimiter_is_bare() {
        let id = parse("hello");
        assert!(id.is_bare());
        assert_eq!(id.name, "hello");
    }

    #[test]
    fn format_round_trips() {
        for qualified in ["github__list", "a__b__c", "mock__hello"] {
            assert_eq!(format(&parse(qualified)), qualified);
        }
    }

    #[test]
    fn wildcard_respects_segment_boundaries() {
        let patterns = compile_patterns(&["github.*".to_string()]).expect("compile");
        assert!(is_allowed(&parse("github__tool"), Some(&patterns)));
        assert!(is_allowed(&parse("github__a__b"), Some(&patterns)));
        // The critical invariant: prefix matching happens per segment,
        // never on raw characters.
        assert!(!is_allowed(&parse("githubenterprise__tool"), Some(&patterns)));
    }

    #[test]
    fn exact_pattern_requires_equal_segment_count() {
        let patterns = compile_patterns(&["mock.hello".to_string()]).expect("compile");
        assert!(is_allowed(&parse("mock__hello"), Some(&patterns)));
        assert!(!is_allowed(&parse("mock__hello__extra"), Some(&patterns)));
        assert!(!is_allowed(&parse("mock__other"), Some(&patterns)));
    }

    #[test]
    fn empty_list_allows_nothing_and_none_allows_everything() {
        let id = parse("mock__hello");
        assert!(!is_allowed(&id, Some(&[])));
        assert!(is_allowed(&id, None));
    }

    #[test]
    fn matching_is_case_sensitive() {
        let patterns = compile_patterns(&["Mock.hello".to_string()]).expect("compile");
        assert!(!is_allowed(&parse("mock__hello"), Some(&patterns)));
    }

    #[test]
    fn bare_star_is_rejected_at_construction() {
        assert!(compile_pattern("*").is_err());
    }

    #[test]
    fn interior_wildcard_is_rejected() {
        assert!(compile_pattern("a.*.b").is_err());
        assert!(compile_pattern("a.b*").is_err());
    }

    #[test]
    fn empty_segment_is_rejected() {
        assert!(compile_pattern("a..b").is_err());
        assert!(compile_pattern(".a").is_err());
    }
}
