//! File and environment configuration for a queue runtime.
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. an optional settings file (format inferred from the extension: toml, yaml or json)
//! 3. environment variables prefixed `QP__` with `__` separating sections,
//!    e.g. `QP__PUMP__RETRY_COUNT=3` sets `pump.retry_count`

use crate::builder::QueueBuilder;
use crate::error::{ConfigurationError, QueueError, ValidationError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Prefix of environment variables read by [`QueueSettings::load`]
pub const ENV_PREFIX: &str = "QP";

/// Which queue backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    File,
    Sqs,
}

/// Settings for the local file backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    /// Active folder; the dead-letter folder is created inside it
    pub path: Option<PathBuf>,

    /// Seconds before an unacknowledged record is retried
    pub retry_delay_seconds: u64,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            path: None,
            retry_delay_seconds: 60,
        }
    }
}

/// Settings for the SQS backend
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsSettings {
    pub queue_name: Option<String>,
    pub region: Option<String>,

    /// Endpoint override, e.g. a local emulator
    pub endpoint: Option<String>,

    /// Falls back to `AWS_ACCESS_KEY_ID` when unset
    pub access_key_id: Option<String>,

    /// Falls back to `AWS_SECRET_ACCESS_KEY` when unset
    pub secret_access_key: Option<String>,
}

impl std::fmt::Debug for SqsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsSettings")
            .field("queue_name", &self.queue_name)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

/// Settings for the receive loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpSettings {
    pub retry_count: u32,
    pub max_simultaneous_messages: usize,
    pub poll_wait_seconds: u64,
    pub max_messages_per_receive: usize,
    pub enable_message_logging: bool,

    /// Wait this long for in-flight messages when receiving stops
    pub drain_timeout_seconds: Option<u64>,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            retry_count: crate::builder::DEFAULT_RETRY_COUNT,
            max_simultaneous_messages: 0,
            poll_wait_seconds: crate::builder::DEFAULT_POLL_WAIT_SECONDS,
            max_messages_per_receive: 1,
            enable_message_logging: false,
            drain_timeout_seconds: None,
        }
    }
}

/// Complete runtime settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub backend: BackendKind,
    pub file: FileSettings,
    pub sqs: SqsSettings,
    pub pump: PumpSettings,
}

impl QueueSettings {
    /// Load settings from an optional file plus `QP__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, QueueError> {
        Self::from_sources(
            path,
            ::config::Environment::with_prefix(ENV_PREFIX).separator("__"),
        )
    }

    pub(crate) fn from_sources(
        path: Option<&Path>,
        environment: ::config::Environment,
    ) -> Result<Self, QueueError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading queue settings file");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let settings: Self = builder
            .add_source(environment)
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check that the selected backend has what it needs
    pub fn validate(&self) -> Result<(), QueueError> {
        match self.backend {
            BackendKind::File => {
                let missing = self
                    .file
                    .path
                    .as_ref()
                    .map_or(true, |p| p.as_os_str().is_empty());
                if missing {
                    return Err(ConfigurationError::Missing {
                        key: "file.path".to_string(),
                    }
                    .into());
                }
            }
            BackendKind::Sqs => {
                for (key, value) in [
                    ("sqs.queue_name", &self.sqs.queue_name),
                    ("sqs.region", &self.sqs.region),
                ] {
                    if value.as_deref().map_or(true, |v| v.trim().is_empty()) {
                        return Err(ConfigurationError::Missing {
                            key: key.to_string(),
                        }
                        .into());
                    }
                }
            }
        }

        if self.pump.retry_count == 0 {
            return Err(ValidationError::OutOfRange {
                field: "pump.retry_count".to_string(),
                message: "must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Builder preloaded with these settings; handlers are added by the caller
    pub fn to_builder(&self) -> Result<QueueBuilder, QueueError> {
        self.validate()?;

        let mut builder = match self.backend {
            BackendKind::File => {
                let path = self.file.path.clone().unwrap_or_default();
                QueueBuilder::file(path)
                    .file_retry_delay(Duration::from_secs(self.file.retry_delay_seconds))
            }
            BackendKind::Sqs => {
                let mut builder = QueueBuilder::sqs(
                    self.sqs.queue_name.clone().unwrap_or_default(),
                    self.sqs.region.clone().unwrap_or_default(),
                );
                if let Some(endpoint) = &self.sqs.endpoint {
                    builder = builder.sqs_endpoint(endpoint.clone());
                }
                if let (Some(id), Some(secret)) =
                    (&self.sqs.access_key_id, &self.sqs.secret_access_key)
                {
                    builder = builder.sqs_credentials(id.clone(), secret.clone());
                }
                builder
            }
        };

        builder = builder
            .retry_count(self.pump.retry_count)
            .max_simultaneous_messages(self.pump.max_simultaneous_messages)
            .poll_wait_seconds(self.pump.poll_wait_seconds)
            .max_messages_per_receive(self.pump.max_messages_per_receive);

        if self.pump.enable_message_logging {
            builder = builder.enable_message_logging();
        }
        if let Some(seconds) = self.pump.drain_timeout_seconds {
            builder = builder.drain_on_stop(Duration::from_secs(seconds));
        }

        Ok(builder)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
