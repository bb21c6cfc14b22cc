//! Error classification.
//!
//! Structured codes are authoritative. Message matching is only consulted
//! when the backend supplied no code, or one this table does not know.

use crate::state::ErrorKind;
use crate::SyncError;

const DUPLICATE_KEY_HINTS: &[&str] = &["duplicate key", "unique constraint", "already exists"];
const CONSTRAINT_HINTS: &[&str] = &["violates", "constraint", "not-null"];
const AUTH_HINTS: &[&str] = &["jwt", "unauthorized", "permission denied", "auth"];
const TIMEOUT_HINTS: &[&str] = &["timeout", "timed out"];
const CONNECTION_HINTS: &[&str] = &["connection", "connect", "refused", "reset"];
const NETWORK_HINTS: &[&str] = &["network", "dns", "offline", "unreachable", "fetch"];

/// Classify a sync failure.
pub fn classify(error: &SyncError) -> ErrorKind {
    match error {
        SyncError::Timeout(_) => ErrorKind::Timeout,
        SyncError::Offline(_) => ErrorKind::Connection,
        other => classify_parts(other.code(), &other.message()),
    }
}

/// Classify from a raw code and message.
pub fn classify_parts(code: Option<&str>, message: &str) -> ErrorKind {
    code.and_then(classify_code)
        .unwrap_or_else(|| classify_message(message))
}

fn classify_code(code: &str) -> Option<ErrorKind> {
    let code = code.trim();
    match code {
        "23505" => Some(ErrorKind::DuplicateKey),
        "23502" | "23503" | "23514" => Some(ErrorKind::ConstraintViolation),
        "PGRST301" | "401" | "403" => Some(ErrorKind::Authentication),
        "57014" => Some(ErrorKind::Timeout),
        c if c.len() == 5 && c.starts_with("08") => Some(ErrorKind::Connection),
        _ => None,
    }
}

fn classify_message(message: &str) -> ErrorKind {
    let message = message.to_lowercase();
    let contains_any = |hints: &[&str]| hints.iter().any(|h| message.contains(h));

    if contains_any(DUPLICATE_KEY_HINTS) {
        ErrorKind::DuplicateKey
    } else if contains_any(CONSTRAINT_HINTS) {
        ErrorKind::ConstraintViolation
    } else if contains_any(AUTH_HINTS) {
        ErrorKind::Authentication
    } else if contains_any(TIMEOUT_HINTS) {
        ErrorKind::Timeout
    } else if contains_any(CONNECTION_HINTS) {
        ErrorKind::Connection
    } else if contains_any(NETWORK_HINTS) {
        ErrorKind::Network
    } else {
        ErrorKind::Unknown
    }
}

/// Whether `kind` is worth retrying automatically.
pub fn recoverable(kind: ErrorKind) -> bool {
    kind.is_recoverable()
}

/// Pull a table name out of a backend error message.
///
/// Understands `on table "x"`, `relation "x"`, `Key (id)=(..) ... in x` and
/// primary-key constraint names such as `"x_pkey"`.
pub fn extract_table(message: &str) -> Option<String> {
    quoted_after(message, "table \"")
        .or_else(|| quoted_after(message, "relation \""))
        .or_else(|| key_detail_table(message))
        .or_else(|| {
            quoted_after(message, "constraint \"").and_then(|name| {
                name.strip_suffix("_pkey")
                    .or_else(|| name.strip_suffix("_key"))
                    .map(str::to_string)
            })
        })
        .filter(|t| !t.is_empty())
}

fn quoted_after(message: &str, marker: &str) -> Option<String> {
    let start = message.find(marker)? + marker.len();
    let rest = &message[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn key_detail_table(message: &str) -> Option<String> {
    let key = message.find("Key (")?;
    let rest = &message[key..];
    let in_pos = rest.find(" in ")? + " in ".len();
    let name: String = rest[in_pos..]
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '.')
        .collect();
    // Schema-qualified names keep only the table part.
    name.rsplit('.').next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(code: Option<&str>, message: &str) -> SyncError {
        SyncError::Backend {
            code: code.map(str::to_string),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_structured_codes_win() {
        assert_eq!(classify(&backend(Some("23505"), "boom")), ErrorKind::DuplicateKey);
        assert_eq!(
            classify(&backend(Some("23502"), "duplicate key")),
            ErrorKind::ConstraintViolation
        );
        assert_eq!(classify(&backend(Some("23503"), "")), ErrorKind::ConstraintViolation);
        assert_eq!(classify(&backend(Some("23514"), "")), ErrorKind::ConstraintViolation);
        assert_eq!(classify(&backend(Some("PGRST301"), "")), ErrorKind::Authentication);
        assert_eq!(classify(&backend(Some("401"), "")), ErrorKind::Authentication);
        assert_eq!(classify(&backend(Some("403"), "")), ErrorKind::Authentication);
        assert_eq!(classify(&backend(Some("57014"), "")), ErrorKind::Timeout);
        assert_eq!(classify(&backend(Some("08006"), "")), ErrorKind::Connection);
    }

    #[test]
    fn test_unknown_code_falls_back_to_message() {
        assert_eq!(
            classify(&backend(Some("500"), "upstream connect error")),
            ErrorKind::Connection
        );
        assert_eq!(classify(&backend(Some("500"), "oops")), ErrorKind::Unknown);
    }

    #[test]
    fn test_message_fallback_table() {
        let cases = [
            ("duplicate key value violates unique constraint", ErrorKind::DuplicateKey),
            ("Row already exists", ErrorKind::DuplicateKey),
            ("null value violates not-null constraint", ErrorKind::ConstraintViolation),
            ("JWT expired", ErrorKind::Authentication),
            ("permission denied for table settings", ErrorKind::Authentication),
            ("request timed out", ErrorKind::Timeout),
            ("Connection refused", ErrorKind::Connection),
            ("connection reset by peer", ErrorKind::Connection),
            ("DNS lookup failed", ErrorKind::Network),
            ("Failed to fetch", ErrorKind::Network),
            ("network is unreachable", ErrorKind::Network),
            ("something odd", ErrorKind::Unknown),
        ];

        for (message, expected) in cases {
            assert_eq!(classify(&backend(None, message)), expected, "{message}");
        }
    }

    #[test]
    fn test_variants_map_directly() {
        assert_eq!(classify(&SyncError::Timeout("GET".into())), ErrorKind::Timeout);
        assert_eq!(classify(&SyncError::Offline("signal".into())), ErrorKind::Connection);
        assert_eq!(
            classify(&SyncError::InvalidPayload("expected value at line 1".into())),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(recoverable(ErrorKind::DuplicateKey));
        assert!(recoverable(ErrorKind::Unknown));
        assert!(!recoverable(ErrorKind::Authentication));
    }

    #[test]
    fn test_extract_table_forms() {
        assert_eq!(
            extract_table(r#"new row violates row-level security policy for table "settings""#)
                .as_deref(),
            Some("settings")
        );
        assert_eq!(
            extract_table(r#"relation "channels" does not exist"#).as_deref(),
            Some("channels")
        );
        assert_eq!(
            extract_table("Key (id)=(1) already exists in public.settings").as_deref(),
            Some("settings")
        );
        assert_eq!(
            extract_table(r#"duplicate key value violates unique constraint "settings_pkey""#)
                .as_deref(),
            Some("settings")
        );
        assert_eq!(extract_table("duplicate key"), None);
    }
}
