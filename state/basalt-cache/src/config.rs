/// Runtime configuration of the state cache aggregate.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheConfig {
    /// Number of recent heights kept out of pruning's reach: a prune request
    /// at height `h` drops expiry groups at or below `h - retention_depth`.
    #[serde(default = "CacheConfig::default_retention_depth")]
    pub retention_depth: u64,
    /// Sub-cache names whose registration is skipped.
    #[serde(default)]
    pub disabled: Vec<String>,
}

impl CacheConfig {
    fn default_retention_depth() -> u64 {
        360
    }

    /// Returns whether the sub-cache named `name` is disabled.
    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled.iter().any(|disabled| disabled == name)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention_depth: Self::default_retention_depth(),
            disabled: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: CacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.retention_depth, 360);
    }

    #[test]
    fn disabled_caches_are_matched_by_name() {
        let config: CacheConfig = serde_json::from_str(
            r#"{ "retention_depth": 40, "disabled": ["reputation"] }"#,
        )
        .unwrap();
        assert_eq!(config.retention_depth, 40);
        assert!(config.is_disabled("reputation"));
        assert!(!config.is_disabled("accounts"));
    }
}
