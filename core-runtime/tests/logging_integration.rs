//! Integration tests for logging system

use bridge_traits::time::LogLevel;
use core_runtime::logging::{
    init_logging, redact_if_sensitive, redact_url, LogFormat, LoggingConfig,
};

#[test]
fn test_logging_config_defaults() {
    let config = LoggingConfig::default();

    assert_eq!(config.level, LogLevel::Info);
    assert!(config.redact_secrets);
    assert!(config.filter.is_none());
    assert!(config.logger_sink.is_none());
}

#[test]
fn test_secret_redaction_by_field_name() {
    assert_eq!(redact_if_sensitive("apikey", "anon-key"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("api_key", "anon-key"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("Authorization", "Bearer abc"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("password", "hunter2"), "[REDACTED]");
}

#[test]
fn test_secret_redaction_by_value() {
    let url = redact_if_sensitive(
        "source",
        "https://db.example.com/rest/v1/channels?select=*&apikey=abc",
    );
    assert!(!url.contains("abc"));
    assert!(url.contains("select=*"));

    assert_eq!(redact_if_sensitive("channel_id", "42"), "42");
}

#[test]
fn test_redact_url_keeps_cache_buster() {
    assert_eq!(
        redact_url("https://cdn.example.com/catalog.json?token=t1&_cb=1700000000000"),
        "https://cdn.example.com/catalog.json?token=[REDACTED]&_cb=1700000000000"
    );
}

#[test]
fn test_init_twice_fails() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn);

    // The first call may lose to another test in this binary; the second never wins.
    let _ = init_logging(config.clone());
    assert!(init_logging(config).is_err());
}

#[test]
fn test_invalid_filter_is_config_error() {
    let config = LoggingConfig::default().with_filter("core_sync=notalevel");
    assert!(init_logging(config).is_err());
}
