//! Outgoing payload policy: optional STX/ETX wrapping, optional trailing
//! newline, and the scripted responses (message on connect, conditional
//! reply).
//!
//! `send` itself is framing-agnostic and transmits exactly the bytes it is
//! given; these helpers produce those bytes from the current settings.

use crate::config::Settings;

/// Start-of-text control byte wrapped around framed payloads.
pub const STX: u8 = 0x02;
/// End-of-text control byte.
pub const ETX: u8 = 0x03;
/// Line feed appended when `append_newline` is set.
pub const LF: u8 = 0x0A;

/// Apply the configured framing to an outgoing payload.
///
/// STX/ETX wrap the payload; the newline goes after the ETX.
pub fn encode_outgoing(settings: &Settings, text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 3);
    if settings.wrap_stx_etx {
        out.push(STX);
    }
    out.extend_from_slice(text.as_bytes());
    if settings.wrap_stx_etx {
        out.push(ETX);
    }
    if settings.append_newline {
        out.push(LF);
    }
    out
}

/// Turn literal `\n` sequences into newlines.
///
/// Scripted strings come from a settings table or a command line where a
/// real newline cannot be typed.
pub fn unescape_newlines(text: &str) -> String {
    text.replace("\\n", "\n")
}

/// Scripted reply for an incoming message: set when a rule is configured
/// and the message matches its trigger exactly.
pub fn auto_reply_for(settings: &Settings, incoming: &str) -> Option<String> {
    let rule = settings.reply_rule.as_ref()?;
    if incoming == unescape_newlines(&rule.trigger) {
        Some(unescape_newlines(&rule.response))
    } else {
        None
    }
}

/// The message to send right after a connection is established, if any.
pub fn connect_message(settings: &Settings) -> Option<String> {
    settings
        .on_connect_message
        .as_deref()
        .filter(|m| !m.is_empty())
        .map(unescape_newlines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplyRule;

    #[test]
    fn test_plain_payload_passes_through() {
        let settings = Settings::default();
        assert_eq!(encode_outgoing(&settings, "hello"), b"hello");
    }

    #[test]
    fn test_stx_etx_wrap() {
        let settings = Settings {
            wrap_stx_etx: true,
            ..Settings::default()
        };
        assert_eq!(encode_outgoing(&settings, "hi"), b"\x02hi\x03");
    }

    #[test]
    fn test_newline_goes_after_etx() {
        let settings = Settings {
            wrap_stx_etx: true,
            append_newline: true,
            ..Settings::default()
        };
        assert_eq!(encode_outgoing(&settings, "hi"), b"\x02hi\x03\n");
    }

    #[test]
    fn test_unescape_newlines() {
        assert_eq!(unescape_newlines("a\\nb"), "a\nb");
        assert_eq!(unescape_newlines("no escapes"), "no escapes");
    }

    #[test]
    fn test_auto_reply_matches_exactly() {
        let settings = Settings {
            reply_rule: Some(ReplyRule {
                trigger: "PING".to_string(),
                response: "PONG".to_string(),
            }),
            ..Settings::default()
        };
        assert_eq!(auto_reply_for(&settings, "PING").as_deref(), Some("PONG"));
        assert_eq!(auto_reply_for(&settings, "PING "), None);
        assert_eq!(auto_reply_for(&settings, "ping"), None);
    }

    #[test]
    fn test_auto_reply_unescapes_both_sides() {
        let settings = Settings {
            reply_rule: Some(ReplyRule {
                trigger: "PING\\n".to_string(),
                response: "PONG\\n".to_string(),
            }),
            ..Settings::default()
        };
        assert_eq!(auto_reply_for(&settings, "PING\n").as_deref(), Some("PONG\n"));
    }

    #[test]
    fn test_no_rule_means_no_reply() {
        let settings = Settings::default();
        assert_eq!(auto_reply_for(&settings, "PING"), None);
    }

    #[test]
    fn test_connect_message_empty_means_disabled() {
        let mut settings = Settings::default();
        assert_eq!(connect_message(&settings), None);
        settings.on_connect_message = Some(String::new());
        assert_eq!(connect_message(&settings), None);
        settings.on_connect_message = Some("HELLO\\n".to_string());
        assert_eq!(connect_message(&settings).as_deref(), Some("HELLO\n"));
    }
}
