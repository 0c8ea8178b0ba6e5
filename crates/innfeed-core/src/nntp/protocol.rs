//! Wire-level NNTP bits: response codes, response parsing, command framing.

use crate::article::MessageId;

pub const CODE_GREETING_POSTING: u16 = 200;
pub const CODE_GREETING_NO_POSTING: u16 = 201;
pub const CODE_STREAMING_OK: u16 = 203;
pub const CODE_CLOSING: u16 = 205;
pub const CODE_IHAVE_ACCEPTED: u16 = 235;
pub const CODE_CHECK_SEND: u16 = 238;
pub const CODE_TAKETHIS_ACCEPTED: u16 = 239;
pub const CODE_IHAVE_SEND: u16 = 335;
pub const CODE_REFUSING: u16 = 400;
pub const CODE_CHECK_DEFER: u16 = 431;
pub const CODE_IHAVE_NOT_WANTED: u16 = 435;
pub const CODE_IHAVE_DEFER: u16 = 436;
pub const CODE_IHAVE_REJECTED: u16 = 437;
pub const CODE_CHECK_NOT_WANTED: u16 = 438;
pub const CODE_TAKETHIS_REJECTED: u16 = 439;
pub const CODE_PERMISSION_DENIED: u16 = 480;
pub const CODE_NO_TALK: u16 = 502;

/// A single parsed NNTP response line.
#[derive(Debug, Clone)]
pub struct Response {
    pub code: u16,
    pub message_id: Option<MessageId>,
    pub text: String,
}

impl Response {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(2, ' ');
        let code: u16 = parts.next()?.parse().ok()?;
        let rest = parts.next().unwrap_or("").trim();
        let (message_id, text) = match rest.split_once(' ') {
            Some((first, tail)) if first.starts_with('<') => {
                (MessageId::parse(first).ok(), tail.to_string())
            }
            None if rest.starts_with('<') => (MessageId::parse(rest).ok(), String::new()),
            _ => (None, rest.to_string()),
        };
        Some(Self {
            code,
            message_id,
            text,
        })
    }
}

/// What a response code means in the abstract, independent of which queue
/// it should be matched against — `connection.rs` maps this onto a queue
/// transition using the current streaming/non-streaming mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    Greeting,
    StreamingAccepted,
    Goodbye,
    Accepted,
    SendIt,
    Refused,
    Defer,
    Rejected,
    PeerRefusing,
    PermissionDenied,
    NoTalk,
    Unknown,
}

pub fn classify(code: u16) -> ResponseOutcome {
    match code {
        CODE_GREETING_POSTING | CODE_GREETING_NO_POSTING => ResponseOutcome::Greeting,
        CODE_STREAMING_OK => ResponseOutcome::StreamingAccepted,
        CODE_CLOSING => ResponseOutcome::Goodbye,
        CODE_IHAVE_ACCEPTED | CODE_TAKETHIS_ACCEPTED => ResponseOutcome::Accepted,
        CODE_CHECK_SEND | CODE_IHAVE_SEND => ResponseOutcome::SendIt,
        CODE_IHAVE_NOT_WANTED | CODE_CHECK_NOT_WANTED => ResponseOutcome::Refused,
        CODE_CHECK_DEFER | CODE_IHAVE_DEFER => ResponseOutcome::Defer,
        CODE_IHAVE_REJECTED | CODE_TAKETHIS_REJECTED => ResponseOutcome::Rejected,
        CODE_REFUSING => ResponseOutcome::PeerRefusing,
        CODE_PERMISSION_DENIED => ResponseOutcome::PermissionDenied,
        CODE_NO_TALK => ResponseOutcome::NoTalk,
        _ => ResponseOutcome::Unknown,
    }
}

/// True for codes that are only legal on a streaming connection.
pub fn is_streaming_only(code: u16) -> bool {
    matches!(
        code,
        CODE_STREAMING_OK
            | CODE_CHECK_SEND
            | CODE_TAKETHIS_ACCEPTED
            | CODE_CHECK_DEFER
            | CODE_CHECK_NOT_WANTED
            | CODE_TAKETHIS_REJECTED
    )
}

/// True for codes that are only legal on a non-streaming (IHAVE) connection.
pub fn is_non_streaming_only(code: u16) -> bool {
    matches!(
        code,
        CODE_IHAVE_ACCEPTED
            | CODE_IHAVE_SEND
            | CODE_IHAVE_NOT_WANTED
            | CODE_IHAVE_DEFER
            | CODE_IHAVE_REJECTED
    )
}

pub fn fmt_mode_stream() -> String {
    "MODE STREAM\r\n".to_string()
}

pub fn fmt_ihave(id: &MessageId) -> String {
    format!("IHAVE {id}\r\n")
}

pub fn fmt_check(id: &MessageId) -> String {
    format!("CHECK {id}\r\n")
}

pub fn fmt_takethis(id: &MessageId) -> String {
    format!("TAKETHIS {id}\r\n")
}

pub fn fmt_quit() -> String {
    "QUIT\r\n".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_check_response() {
        let r = Response::parse("238 <m1@a>\r\n").unwrap();
        assert_eq!(r.code, 238);
        assert_eq!(r.message_id.unwrap().as_str(), "<m1@a>");
    }

    #[test]
    fn parse_greeting_without_message_id() {
        let r = Response::parse("200 ready\r\n").unwrap();
        assert_eq!(r.code, 200);
        assert!(r.message_id.is_none());
        assert_eq!(r.text, "ready");
    }

    #[test]
    fn classification_matches_spec_table() {
        assert_eq!(classify(203), ResponseOutcome::StreamingAccepted);
        assert_eq!(classify(238), ResponseOutcome::SendIt);
        assert_eq!(classify(431), ResponseOutcome::Defer);
        assert_eq!(classify(435), ResponseOutcome::Refused);
        assert_eq!(classify(437), ResponseOutcome::Rejected);
        assert!(is_streaming_only(238));
        assert!(is_non_streaming_only(335));
    }
}
