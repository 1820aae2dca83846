use std::time::Duration;

use thiserror::Error;

use crate::pipeline::retry::RetryPolicy;

/// Application-level constants
pub const APP_NAME: &str = "Retina Triage";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variables probed for the API credential, in order.
pub const CREDENTIAL_VARS: &[&str] = &["GEMINI_API_KEY", "API_KEY"];

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_CLASSIFIER_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

const API_BASE_VAR: &str = "RETINA_API_BASE";
const CLASSIFIER_MODEL_VAR: &str = "RETINA_CLASSIFIER_MODEL";
const IMAGE_MODEL_VAR: &str = "RETINA_IMAGE_MODEL";
const MAX_ATTEMPTS_VAR: &str = "RETINA_MAX_ATTEMPTS";
const INITIAL_DELAY_VAR: &str = "RETINA_INITIAL_DELAY_MS";

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "retina_triage=info,warn"
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Runtime configuration for the remote analysis client.
///
/// The credential is optional at load time: a missing key only fails when an
/// analysis is actually requested, so the queue can still be built and inspected.
#[derive(Clone)]
pub struct AnalysisConfig {
    pub credential: Option<String>,
    pub api_base: String,
    pub classifier_model: String,
    pub image_model: String,
    pub retry: RetryPolicy,
}

impl std::fmt::Debug for AnalysisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisConfig")
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .field("classifier_model", &self.classifier_model)
            .field("image_model", &self.image_model)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            credential: None,
            api_base: DEFAULT_API_BASE.to_string(),
            classifier_model: DEFAULT_CLASSIFIER_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl AnalysisConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup (env, map, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let credential = CREDENTIAL_VARS.iter().find_map(|var| non_empty(var));

        let mut retry = defaults.retry;
        if let Some(raw) = non_empty(MAX_ATTEMPTS_VAR) {
            retry.max_attempts = raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidValue {
                    var: MAX_ATTEMPTS_VAR,
                    value: raw.clone(),
                })?;
        }
        if let Some(raw) = non_empty(INITIAL_DELAY_VAR) {
            let millis = raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                var: INITIAL_DELAY_VAR,
                value: raw.clone(),
            })?;
            retry.initial_delay = Duration::from_millis(millis);
        }

        Ok(Self {
            credential,
            api_base: non_empty(API_BASE_VAR)
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base),
            classifier_model: non_empty(CLASSIFIER_MODEL_VAR).unwrap_or(defaults.classifier_model),
            image_model: non_empty(IMAGE_MODEL_VAR).unwrap_or(defaults.image_model),
            retry,
        })
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = AnalysisConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.credential.is_none());
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.classifier_model, DEFAULT_CLASSIFIER_MODEL);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn primary_credential_wins_over_fallback() {
        let config = AnalysisConfig::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "primary"),
            ("API_KEY", "fallback"),
        ]))
        .unwrap();
        assert_eq!(config.credential.as_deref(), Some("primary"));
    }

    #[test]
    fn fallback_credential_used_when_primary_blank() {
        let config = AnalysisConfig::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "  "),
            ("API_KEY", "fallback"),
        ]))
        .unwrap();
        assert_eq!(config.credential.as_deref(), Some("fallback"));
    }

    #[test]
    fn retry_overrides_are_parsed() {
        let config = AnalysisConfig::from_lookup(lookup(&[
            ("RETINA_MAX_ATTEMPTS", "2"),
            ("RETINA_INITIAL_DELAY_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(250));
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = AnalysisConfig::from_lookup(lookup(&[("RETINA_MAX_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "RETINA_MAX_ATTEMPTS", .. }));
    }

    #[test]
    fn api_base_trailing_slash_trimmed() {
        let config = AnalysisConfig::from_lookup(lookup(&[(
            "RETINA_API_BASE",
            "http://localhost:8080/v1beta/",
        )]))
        .unwrap();
        assert_eq!(config.api_base, "http://localhost:8080/v1beta");
    }

    #[test]
    fn debug_output_redacts_credential() {
        let config = AnalysisConfig::default().with_credential("super-secret");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn app_name_is_retina_triage() {
        assert_eq!(APP_NAME, "Retina Triage");
    }
}
