use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal port of the Pulsar binary protocol.
pub const BROKER_PORT: u16 = 6650;

/// Internal port of the HTTP admin/service API.
pub const WEB_SERVICE_PORT: u16 = 8080;

/// Optional on/off switch where "not set" is distinct from "off".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toggle {
    #[default]
    Unspecified,
    Enabled,
    Disabled,
}

impl Toggle {
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }

    pub const fn is_disabled(self) -> bool {
        matches!(self, Self::Disabled)
    }
}

impl From<bool> for Toggle {
    fn from(value: bool) -> Self {
        if value {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

impl From<Option<bool>> for Toggle {
    fn from(value: Option<bool>) -> Self {
        value.map_or(Self::Unspecified, Self::from)
    }
}

impl fmt::Display for Toggle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unspecified => "unspecified",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        };
        f.write_str(label)
    }
}

/// Settings a fixture is created with. Never changes after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulsarConfig {
    pub image_tag: String,
    #[serde(default)]
    pub authentication: Toggle,
    #[serde(default)]
    pub functions_worker: Toggle,
}

impl PulsarConfig {
    pub fn new(image_tag: impl Into<String>) -> Self {
        Self {
            image_tag: image_tag.into(),
            authentication: Toggle::Unspecified,
            functions_worker: Toggle::Unspecified,
        }
    }

    /// Images in the 3.2 line (and `latest`) read `--expiry-time` as
    /// milliseconds, so the value has to be inflated to get the intended
    /// lifetime in seconds.
    pub fn token_expiry_scale(&self) -> u64 {
        if self.image_tag.starts_with("3.2") || self.image_tag.starts_with("latest") {
            1000
        } else {
            1
        }
    }
}

/// Captured result of a command run inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_from_optional_bool() {
        assert_eq!(Toggle::from(None::<bool>), Toggle::Unspecified);
        assert_eq!(Toggle::from(Some(true)), Toggle::Enabled);
        assert_eq!(Toggle::from(Some(false)), Toggle::Disabled);
        assert!(!Toggle::Unspecified.is_enabled());
        assert!(!Toggle::Unspecified.is_disabled());
    }

    #[test]
    fn test_token_expiry_scale_by_tag() {
        assert_eq!(PulsarConfig::new("3.2.1").token_expiry_scale(), 1000);
        assert_eq!(PulsarConfig::new("3.2").token_expiry_scale(), 1000);
        assert_eq!(PulsarConfig::new("latest").token_expiry_scale(), 1000);
        assert_eq!(PulsarConfig::new("latest-foo").token_expiry_scale(), 1000);
        assert_eq!(PulsarConfig::new("3.3.0").token_expiry_scale(), 1);
        assert_eq!(PulsarConfig::new("3.0.6").token_expiry_scale(), 1);
        // prefix match only
        assert_eq!(PulsarConfig::new("v3.2.1").token_expiry_scale(), 1);
    }

    #[test]
    fn test_config_deserializes_with_missing_toggles() {
        let config: PulsarConfig = serde_json::from_str(r#"{"image_tag":"3.1.0"}"#).unwrap();
        assert_eq!(config.authentication, Toggle::Unspecified);
        assert_eq!(config.functions_worker, Toggle::Unspecified);

        let config: PulsarConfig = serde_json::from_str(
            r#"{"image_tag":"3.1.0","authentication":"enabled","functions_worker":"disabled"}"#,
        )
        .unwrap();
        assert_eq!(config.authentication, Toggle::Enabled);
        assert_eq!(config.functions_worker, Toggle::Disabled);
    }

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput::default();
        assert!(ok.success());

        let failed = ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert!(!failed.success());
    }
}
