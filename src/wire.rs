//! Wire shapes for the keepalive ping and the admin liveness probe.
//!
//! Frames are tagged text: `<tag>,<payload>`. Replies are routed back by tag
//! through the listener registry, so this module only deals with the bodies.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::{KeepaliveError, ProbeFailure};

/// Keepalive ping frame: marker plus an empty tag and empty payload.
pub const KEEPALIVE_FRAME: &str = "?,,";

/// Reserved tag the remote uses for keepalive pong replies.
pub const KEEPALIVE_TAG: &str = "!";

/// Payload of the admin liveness probe.
pub const ADMIN_TEST_PAYLOAD: &str = r#"["admin","test"]"#;

/// Tag correlating an outbound probe with its reply.
///
/// Built from the wall-clock second and the connection's message counter, so
/// two probes issued in the same second never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageTag(String);

impl MessageTag {
    pub fn new(unix_secs: u64, counter: u64) -> Self {
        Self(format!("{unix_secs}.--{counter}"))
    }

    /// Tag for `counter` at the current wall-clock second.
    pub fn now(counter: u64) -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self::new(secs, counter)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encode the admin liveness probe frame for `tag`.
pub fn admin_test_frame(tag: &MessageTag) -> String {
    format!("{tag},{ADMIN_TEST_PAYLOAD}")
}

/// Decode a keepalive pong: a bare decimal millisecond epoch timestamp.
pub fn parse_pong(body: &str) -> Result<SystemTime, KeepaliveError> {
    let millis: u64 = body
        .parse()
        .map_err(|source| KeepaliveError::InvalidTimestamp {
            body: body.to_string(),
            source,
        })?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

/// Decode an admin liveness probe reply.
///
/// The only accepted shape is a two-element array `[marker, bool]` whose
/// first element is a string. `true` means alive, `false` is an explicit
/// rejection. Everything else is malformed.
pub fn parse_admin_test_reply(body: &str) -> Result<(), ProbeFailure> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ProbeFailure::Malformed(format!("error decoding response message: {e}")))?;

    match value.as_array().map(Vec::as_slice) {
        Some([Value::String(_), Value::Bool(true)]) => Ok(()),
        Some([Value::String(_), Value::Bool(false)]) => Err(ProbeFailure::Rejected),
        _ => Err(ProbeFailure::Malformed(body.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn keepalive_frame_is_marker_with_empty_payload() {
        assert_eq!(KEEPALIVE_FRAME, "?,,");
        assert_eq!(KEEPALIVE_TAG, "!");
    }

    #[test]
    fn admin_test_frame_is_tag_comma_payload() {
        let tag = MessageTag::new(1_700_000_000, 3);
        assert_eq!(tag.as_str(), "1700000000.--3");
        assert_eq!(
            admin_test_frame(&tag),
            r#"1700000000.--3,["admin","test"]"#
        );
    }

    #[test]
    fn same_second_tags_differ_by_counter() {
        assert_ne!(MessageTag::new(10, 1), MessageTag::new(10, 2));
    }

    #[test]
    fn pong_keeps_millisecond_precision() {
        let seen = parse_pong("1700000000123").unwrap();
        let since_epoch = seen.duration_since(UNIX_EPOCH).unwrap();
        assert_eq!(since_epoch.as_secs(), 1_700_000_000);
        assert_eq!(since_epoch.subsec_millis(), 123);
    }

    #[rstest]
    #[case("")]
    #[case("abc")]
    #[case("-5")]
    #[case("12.5")]
    #[case(" 1700000000000")]
    #[case("1700000000000\n")]
    fn pong_rejects_non_numeric(#[case] body: &str) {
        assert!(matches!(
            parse_pong(body),
            Err(KeepaliveError::InvalidTimestamp { .. })
        ));
    }

    #[rstest]
    #[case(r#"["Pong",true]"#)]
    #[case(r#"["anything", true]"#)]
    fn reply_true_is_alive(#[case] body: &str) {
        assert_eq!(parse_admin_test_reply(body), Ok(()));
    }

    #[test]
    fn reply_false_is_rejected() {
        assert_eq!(
            parse_admin_test_reply(r#"["Pong",false]"#),
            Err(ProbeFailure::Rejected)
        );
    }

    #[rstest]
    #[case("not json")]
    #[case(r#"{"Pong":true}"#)]
    #[case(r#"["Pong"]"#)]
    #[case(r#"["Pong",true,1]"#)]
    #[case(r#"["Pong","true"]"#)]
    #[case(r#"[1,true]"#)]
    #[case(r#"[]"#)]
    fn other_shapes_are_malformed(#[case] body: &str) {
        assert!(matches!(
            parse_admin_test_reply(body),
            Err(ProbeFailure::Malformed(_))
        ));
    }
}
