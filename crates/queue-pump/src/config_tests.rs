//! Tests for [`QueueSettings`] loading and validation.

use super::*;
use std::collections::HashMap;
use tempfile::TempDir;

fn environment(vars: &[(&str, &str)]) -> ::config::Environment {
    let source: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ::config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .source(Some(source.into_iter().collect()))
}

fn write_settings(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_defaults() {
    let settings = QueueSettings::default();

    assert_eq!(settings.backend, BackendKind::File);
    assert_eq!(settings.file.retry_delay_seconds, 60);
    assert_eq!(settings.pump.retry_count, 5);
    assert_eq!(settings.pump.poll_wait_seconds, 14);
    assert_eq!(settings.pump.max_simultaneous_messages, 0);
    assert_eq!(settings.pump.max_messages_per_receive, 1);
    assert_eq!(settings.pump.drain_timeout_seconds, None);
}

#[test]
fn test_default_settings_fail_validation_without_path() {
    let result = QueueSettings::default().validate();

    assert!(matches!(
        result,
        Err(QueueError::ConfigurationError(ConfigurationError::Missing { ref key })) if key == "file.path"
    ));
}

#[test]
fn test_load_from_toml_file() {
    let dir = TempDir::new().unwrap();
    let path = write_settings(
        &dir,
        "queue.toml",
        r#"
backend = "file"

[file]
path = "/var/lib/orders"
retry_delay_seconds = 5

[pump]
retry_count = 3
max_simultaneous_messages = 4
poll_wait_seconds = 2
"#,
    );

    let settings = QueueSettings::from_sources(Some(&path), environment(&[])).unwrap();

    assert_eq!(settings.file.path, Some(PathBuf::from("/var/lib/orders")));
    assert_eq!(settings.file.retry_delay_seconds, 5);
    assert_eq!(settings.pump.retry_count, 3);
    assert_eq!(settings.pump.max_simultaneous_messages, 4);
    assert_eq!(settings.pump.poll_wait_seconds, 2);
    // Untouched values keep their defaults
    assert_eq!(settings.pump.max_messages_per_receive, 1);
}

#[test]
fn test_load_from_yaml_file() {
    let dir = TempDir::new().unwrap();
    let path = write_settings(
        &dir,
        "queue.yaml",
        "backend: sqs\nsqs:\n  queue_name: orders\n  region: eu-west-1\n",
    );

    let settings = QueueSettings::from_sources(Some(&path), environment(&[])).unwrap();

    assert_eq!(settings.backend, BackendKind::Sqs);
    assert_eq!(settings.sqs.queue_name.as_deref(), Some("orders"));
    assert_eq!(settings.sqs.region.as_deref(), Some("eu-west-1"));
}

#[test]
fn test_environment_overrides_file() {
    let dir = TempDir::new().unwrap();
    let path = write_settings(
        &dir,
        "queue.toml",
        "[file]\npath = \"/from/file\"\n\n[pump]\nretry_count = 3\n",
    );

    let settings = QueueSettings::from_sources(
        Some(&path),
        environment(&[
            ("QP__PUMP__RETRY_COUNT", "7"),
            ("QP__PUMP__DRAIN_TIMEOUT_SECONDS", "15"),
            ("QP__FILE__PATH", "/from/env"),
        ]),
    )
    .unwrap();

    assert_eq!(settings.pump.retry_count, 7);
    assert_eq!(settings.pump.drain_timeout_seconds, Some(15));
    assert_eq!(settings.file.path, Some(PathBuf::from("/from/env")));
}

#[test]
fn test_missing_required_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent.toml");

    let result = QueueSettings::from_sources(Some(&missing), environment(&[]));

    assert!(matches!(
        result,
        Err(QueueError::ConfigurationError(ConfigurationError::Parsing { .. }))
    ));
}

#[test]
fn test_sqs_requires_queue_name_and_region() {
    let mut settings = QueueSettings {
        backend: BackendKind::Sqs,
        ..Default::default()
    };
    settings.sqs.queue_name = Some("orders".to_string());

    let result = settings.validate();
    assert!(matches!(
        result,
        Err(QueueError::ConfigurationError(ConfigurationError::Missing { ref key })) if key == "sqs.region"
    ));
}

#[test]
fn test_zero_retry_count_is_rejected() {
    let mut settings = QueueSettings::default();
    settings.file.path = Some(PathBuf::from("/tmp/queue"));
    settings.pump.retry_count = 0;

    assert!(matches!(
        settings.validate(),
        Err(QueueError::ValidationError(_))
    ));
}

#[test]
fn test_sqs_settings_debug_redacts_secret() {
    let settings = SqsSettings {
        secret_access_key: Some("very-secret".to_string()),
        ..Default::default()
    };

    let debug = format!("{:?}", settings);
    assert!(!debug.contains("very-secret"));
    assert!(debug.contains("<REDACTED>"));
}

#[tokio::test]
async fn test_to_builder_creates_file_runtime() {
    let dir = TempDir::new().unwrap();
    let mut settings = QueueSettings::default();
    settings.file.path = Some(dir.path().join("orders"));

    let runtime = settings.to_builder().unwrap().build_send_only().unwrap();

    assert!(runtime.queue_name().ends_with("orders"));
    assert!(!runtime.can_receive());
}
