use serde::Deserialize;
use serde::Serialize;

/// Hard per-execution resource ceilings. Immutable once an execution starts;
/// exceeding any single field terminates the execution with the matching
/// error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub max_output_bytes: u64,
    pub max_log_entries: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            memory_mb: 512,
            max_output_bytes: 1024 * 1024,
            max_log_entries: 1_000,
        }
    }
}

impl ResourceLimits {
    /// Every field must be at least 1.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("timeoutMs", self.timeout_ms),
            ("memoryMb", self.memory_mb),
            ("maxOutputBytes", self.max_output_bytes),
            ("maxLogEntries", self.max_log_entries),
        ] {
            if value == 0 {
                return Err(format!("{name} must be >= 1"));
            }
        }
        Ok(())
    }
}

/// Caller-provided partial limits. Fields that are present shallow-override
/// the server defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimitsOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_log_entries: Option<u64>,
}

impl ResourceLimitsOverride {
    pub fn merged_with(&self, defaults: ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            timeout_ms: self.timeout_ms.unwrap_or(defaults.timeout_ms),
            memory_mb: self.memory_mb.unwrap_or(defaults.memory_mb),
            max_output_bytes: self.max_output_bytes.unwrap_or(defaults.max_output_bytes),
            max_log_entries: self.max_log_entries.unwrap_or(defaults.max_log_entries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn merge_overrides_only_present_fields() {
        let overrides = ResourceLimitsOverride {
            timeout_ms: Some(100),
            ..Default::default()
        };
        let merged = overrides.merged_with(ResourceLimits::default());
        assert_eq!(merged.timeout_ms, 100);
        assert_eq!(merged.memory_mb, ResourceLimits::default().memory_mb);
    }

    #[test]
    fn zero_fields_are_rejected() {
        let limits = ResourceLimits {
            max_output_bytes: 0,
            ..Default::default()
        };
        let err = limits.validate().expect_err("must reject zero");
        assert_eq!(err, "maxOutputBytes must be >= 1");
    }

    #[test]
    fn camel_case_on_the_wire() {
        let parsed: ResourceLimitsOverride =
            serde_json::from_str(r#"{"timeoutMs":5000,"memoryMb":128}"#).expect("parse");
        assert_eq!(parsed.timeout_ms, Some(5000));
        assert_eq!(parsed.memory_mb, Some(128));
    }
}
