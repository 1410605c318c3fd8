//! Configuration for the excomms gateway
//!
//! Values are layered: built-in defaults, then an optional file, then
//! `EXCOMMS__SECTION__KEY` environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{ExcommsError, Result};

/// Time a proxy number is held for a caller before they dial in.
pub const DEFAULT_RESERVATION_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Cool-down on a proxy number after its call ends.
pub const DEFAULT_SHORT_GRACE: Duration = Duration::from_secs(5 * 60);

/// Upper bound on a reservation while its call is live.
pub const DEFAULT_ONGOING_CALL_CEILING: Duration = Duration::from_secs(5 * 60 * 60);

/// Age after which a voicemail is published without its transcription.
pub const DEFAULT_TRANSCRIPTION_DEADLINE: Duration = Duration::from_secs(15 * 60);

/// Delay before the tracker looks at a transcription job again.
pub const DEFAULT_TRANSCRIPTION_BACKOFF: Duration = Duration::from_secs(60);

/// Numbers the telephony provider can ring simultaneously.
pub const MAX_FORWARDING_NUMBERS: usize = 10;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ExcommsConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub proxy_numbers: ProxyNumberConfig,
    pub transcription: TranscriptionConfig,
    pub tasks: TaskConfig,
    pub telephony: TelephonyConfig,
    pub email: EmailConfig,
    pub media: MediaConfig,
    pub topics: TopicConfig,
    pub logging: LogSettings,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

/// Webhook listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_address: String,
    /// Public base URL the telephony provider uses to reach this service
    pub api_url: String,
    /// Deadline applied to each webhook request
    pub request_timeout_secs: u64,
}

/// Proxy-number policy windows
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyNumberConfig {
    pub reservation_window_secs: u64,
    pub short_grace_secs: u64,
    pub ongoing_call_ceiling_secs: u64,
}

/// Transcription tracking
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub deadline_secs: u64,
    pub backoff_secs: u64,
    pub poll_timeout_secs: u64,
    /// Validity of the URL handed to the transcription provider
    pub media_url_ttl_secs: u64,
}

/// Detached background tasks
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub timeout_secs: u64,
}

/// Telephony provider credentials
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelephonyConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub application_sid: String,
    pub api_base: String,
}

/// Outbound email policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub sender_domain: String,
    pub transactional_domain: String,
}

/// Media signing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub signing_key: String,
    pub api_base: String,
}

/// Event bus topic names
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub incoming_raw_message: String,
    pub external_message: String,
    pub resource_cleanup: String,
    pub service_events: String,
}

/// Logging settings as they appear in configuration files
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
    pub file_info: bool,
}

impl ExcommsConfig {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("EXCOMMS")
                .prefix_separator("__")
                .separator("__"),
        );

        let settings = builder
            .build()
            .map_err(|e| ExcommsError::config(e.to_string()))?;
        let config: ExcommsConfig = settings
            .try_deserialize()
            .map_err(|e| ExcommsError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Reject settings that would make the state machines misbehave
    pub fn validate(&self) -> Result<()> {
        let p = &self.proxy_numbers;
        if p.reservation_window_secs == 0 || p.short_grace_secs == 0 {
            return Err(ExcommsError::config("proxy number windows must be non-zero"));
        }
        if p.ongoing_call_ceiling_secs < p.reservation_window_secs {
            return Err(ExcommsError::config(
                "ongoing call ceiling must not be shorter than the reservation window",
            ));
        }
        if self.transcription.backoff_secs == 0 {
            return Err(ExcommsError::config("transcription backoff must be non-zero"));
        }
        Ok(())
    }
}

impl ProxyNumberConfig {
    pub fn reservation_window(&self) -> Duration {
        Duration::from_secs(self.reservation_window_secs)
    }

    pub fn short_grace(&self) -> Duration {
        Duration::from_secs(self.short_grace_secs)
    }

    pub fn ongoing_call_ceiling(&self) -> Duration {
        Duration::from_secs(self.ongoing_call_ceiling_secs)
    }
}

impl TranscriptionConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn media_url_ttl(&self) -> Duration {
        Duration::from_secs(self.media_url_ttl_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://excomms.db?mode=rwc".to_string(),
            max_connections: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8900".to_string(),
            api_url: "http://127.0.0.1:8900".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl Default for ProxyNumberConfig {
    fn default() -> Self {
        Self {
            reservation_window_secs: DEFAULT_RESERVATION_WINDOW.as_secs(),
            short_grace_secs: DEFAULT_SHORT_GRACE.as_secs(),
            ongoing_call_ceiling_secs: DEFAULT_ONGOING_CALL_CEILING.as_secs(),
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            deadline_secs: DEFAULT_TRANSCRIPTION_DEADLINE.as_secs(),
            backoff_secs: DEFAULT_TRANSCRIPTION_BACKOFF.as_secs(),
            poll_timeout_secs: 30,
            media_url_ttl_secs: 30 * 60,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            application_sid: String::new(),
            api_base: "https://api.twilio.com/2010-04-01".to_string(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            sender_domain: "excomms.local".to_string(),
            transactional_domain: "mail.excomms.local".to_string(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            signing_key: "change-me".to_string(),
            api_base: "http://127.0.0.1:8900".to_string(),
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            incoming_raw_message: "incoming-raw-message".to_string(),
            external_message: "external-message".to_string(),
            resource_cleanup: "resource-cleanup".to_string(),
            service_events: "excomms-events".to_string(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy_constants() {
        let config = ExcommsConfig::default();
        assert_eq!(config.proxy_numbers.reservation_window(), DEFAULT_RESERVATION_WINDOW);
        assert_eq!(config.proxy_numbers.short_grace(), DEFAULT_SHORT_GRACE);
        assert_eq!(config.proxy_numbers.ongoing_call_ceiling(), DEFAULT_ONGOING_CALL_CEILING);
        assert_eq!(config.transcription.deadline(), DEFAULT_TRANSCRIPTION_DEADLINE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ceiling_shorter_than_window_is_rejected() {
        let mut config = ExcommsConfig::default();
        config.proxy_numbers.ongoing_call_ceiling_secs = 60;
        match config.validate().unwrap_err() {
            ExcommsError::Config(_) => {}
            e => panic!("unexpected error {:?}", e),
        }
    }
}
