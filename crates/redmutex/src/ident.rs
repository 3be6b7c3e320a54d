//! Owner identities, stored lock values and key rendering.
//!
//! An owner is identified by `{runtime-uuid}${pid}@{token}`. The uuid is
//! generated once per runtime, the pid distinguishes forked processes sharing
//! a uuid, and the token distinguishes local tasks (or deliberately joins
//! them when a caller supplies its own).
//!
//! Under the transactional strategy the stored value is
//! `"{identity} {expiration-epoch-seconds}"`; under the scripted strategy the
//! value is the identity alone and expiration lives in the key's TTL.

use chrono::Utc;

use crate::error::MutexError;

/// Render an owner identity from the runtime uuid and an owner token.
pub(crate) fn owner_ident(uuid: &str, token: &str) -> String {
    format!("{uuid}${}@{token}", std::process::id())
}

/// Render the full Redis key for a lock name with an optional namespace.
pub(crate) fn render_key(ns: Option<&str>, name: &str) -> String {
    match ns {
        Some(ns) => format!("{ns}:{name}"),
        None => name.to_string(),
    }
}

/// Encode a transactional lock value: identity plus expiration instant.
pub(crate) fn encode_value(ident: &str, expires_at: f64) -> String {
    format!("{ident} {expires_at:.6}")
}

/// Split a transactional lock value into identity and expiration instant.
///
/// Values that do not parse decode as expired (epoch 0), so garbage entries
/// are reclaimed by the next contender instead of blocking it forever.
pub(crate) fn decode_value(raw: &str) -> (&str, f64) {
    match raw.rsplit_once(' ') {
        Some((ident, ts)) => (ident, ts.parse().unwrap_or(0.0)),
        None => (raw, 0.0),
    }
}

/// Current time as fractional epoch seconds.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn now_epoch() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Validate a caller-supplied owner token.
///
/// The transactional value format is space-delimited, so tokens must be
/// non-empty and free of whitespace.
pub(crate) fn validate_owner_token(token: &str) -> Result<(), MutexError> {
    if token.is_empty() {
        return Err(MutexError::Configuration(
            "owner token must not be empty".into(),
        ));
    }
    if token.chars().any(char::is_whitespace) {
        return Err(MutexError::Configuration(format!(
            "owner token {token:?} must not contain whitespace"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_embeds_uuid_pid_and_token() {
        let ident = owner_ident("abc-123", "t0");
        assert!(ident.starts_with("abc-123$"));
        assert!(ident.ends_with("@t0"));
        assert!(ident.contains(&std::process::id().to_string()));
    }

    #[test]
    fn renders_namespaced_key() {
        assert_eq!(render_key(Some("jobs"), "nightly"), "jobs:nightly");
        assert_eq!(render_key(None, "nightly"), "nightly");
    }

    #[test]
    fn value_round_trip() {
        let ident = owner_ident("u", "task-1");
        let raw = encode_value(&ident, 1_700_000_000.25);
        let (decoded, expires_at) = decode_value(&raw);
        assert_eq!(decoded, ident);
        assert!((expires_at - 1_700_000_000.25).abs() < 1e-6);
    }

    #[test]
    fn garbage_value_decodes_as_expired() {
        let (ident, expires_at) = decode_value("not-a-lock-value");
        assert_eq!(ident, "not-a-lock-value");
        assert_eq!(expires_at, 0.0);

        let (_, expires_at) = decode_value("owner not-a-number");
        assert_eq!(expires_at, 0.0);
    }

    #[test]
    fn rejects_bad_owner_tokens() {
        assert!(validate_owner_token("worker-7").is_ok());
        assert!(validate_owner_token("").is_err());
        assert!(validate_owner_token("two words").is_err());
    }

    #[test]
    fn now_epoch_is_recent() {
        let now = now_epoch();
        // 2020-01-01 as a sanity floor.
        assert!(now > 1_577_836_800.0);
    }
}
