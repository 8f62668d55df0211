use std::collections::HashMap;

/// Default transient-error substrings (spec §4.6): case-insensitive,
/// matched against the handler's error message.
const DEFAULT_PATTERNS: &[&str] = &["timeout", "connection", "temporary", "deadlock"];

/// Classifies a handler error message as transient or permanent.
/// Overridable per command-type (spec §4.6 "Overridable per command-type");
/// a command-type with no override falls back to [`DEFAULT_PATTERNS`].
#[derive(Debug, Clone)]
pub struct TransientClassifier {
    overrides: HashMap<String, Vec<String>>,
}

impl Default for TransientClassifier {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
        }
    }
}

impl TransientClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, command_type: impl Into<String>, patterns: Vec<String>) -> Self {
        self.overrides.insert(command_type.into(), patterns);
        self
    }

    pub fn is_transient(&self, command_type: &str, error_message: &str) -> bool {
        let lower = error_message.to_lowercase();
        match self.overrides.get(command_type) {
            Some(patterns) => patterns.iter().any(|p| lower.contains(&p.to_lowercase())),
            None => DEFAULT_PATTERNS.iter().any(|p| lower.contains(p)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_patterns_match_case_insensitively() {
        let c = TransientClassifier::new();
        assert!(c.is_transient("CreateUser", "Connection Reset by peer"));
        assert!(c.is_transient("CreateUser", "operation TIMEOUT"));
        assert!(!c.is_transient("CreateUser", "validation failed: bad email"));
    }

    #[test]
    fn per_command_type_override_replaces_defaults() {
        let c = TransientClassifier::new()
            .with_override("ChargeCard", vec!["gateway_unavailable".to_string()]);
        assert!(c.is_transient("ChargeCard", "GATEWAY_UNAVAILABLE: retry later"));
        // The override replaces, rather than extends, the default list.
        assert!(!c.is_transient("ChargeCard", "connection reset"));
        // A different command type still uses the defaults.
        assert!(c.is_transient("CreateUser", "connection reset"));
    }
}
