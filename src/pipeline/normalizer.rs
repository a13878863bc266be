//! Content normalizer: raw RFC 5322 bytes → `NormalizedMessage`.
//!
//! Header decoding and MIME walking go through `mail_parser`; the raw
//! header block is also scanned directly so a header `mail_parser` cannot
//! decode still shows up verbatim. Body extraction is best effort and
//! never fails the message.

use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use mail_parser::{Address, Message, MessageParser, MessagePart, MimeHeaders, PartType};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::DispatchError;

/// Body used when no text can be recovered.
pub const BODY_PLACEHOLDER: &str = "[Unable to extract email body]";

/// Rendered when the message has no `Date` header.
pub const UNKNOWN_DATE: &str = "Unknown";

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Transport and MIME header lines that leak into bodies of simple mailers.
static LEAKED_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(content-[a-z0-9-]*|mime-[a-z0-9-]*|return-[a-z0-9-]*|received|message-id)\s*:")
        .expect("leaked header pattern is valid")
});

/// A message reduced to what gets forwarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizedMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: String,
    pub body: String,
}

/// Parse raw message bytes.
///
/// Fails only when there is no valid header block followed by a blank line.
pub fn normalize(raw: &[u8]) -> Result<NormalizedMessage, DispatchError> {
    let (headers, body_offset) = split_headers(raw)?;
    let raw_body = &raw[body_offset..];

    let parsed = MessageParser::default().parse(raw);
    if parsed.is_none() {
        warn!("MIME parser rejected message, using raw headers");
    }
    let parsed = parsed.as_ref();

    let raw_header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    let from = parsed
        .and_then(|m| join_addresses(m.from()))
        .or_else(|| raw_header("From").map(clean_address))
        .unwrap_or_default();
    let to = parsed
        .and_then(|m| join_addresses(m.to()))
        .or_else(|| raw_header("To").map(clean_address))
        .unwrap_or_default();
    let subject = pick_subject(parsed.and_then(|m| m.subject()), raw_header("Subject"));
    let date = format_date(parsed, raw_header("Date"));

    let content_type = raw_header("Content-Type").unwrap_or_default();
    let body = if content_type.to_ascii_lowercase().contains("multipart/") {
        multipart_text(parsed, raw_body)
    } else {
        single_part_text(parsed, raw_body)
    };

    let body = body.unwrap_or_else(|| {
        warn!("Failed to extract email body, using placeholder");
        BODY_PLACEHOLDER.to_string()
    });

    debug!(%from, %to, %subject, body_len = body.len(), "Normalized message");

    Ok(NormalizedMessage {
        from,
        to,
        subject,
        date,
        body,
    })
}

/// Decoded subject when it has content, otherwise the raw header value.
fn pick_subject(decoded: Option<&str>, raw: Option<&str>) -> String {
    decoded
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| raw.map(str::trim))
        .unwrap_or_default()
        .to_string()
}

/// Read the header block, returning unfolded `(name, value)` pairs and the
/// offset where the body starts.
fn split_headers(raw: &[u8]) -> Result<(Vec<(String, String)>, usize), DispatchError> {
    let fail = |reason: &str| DispatchError::ParseFailure(reason.to_string());

    let mut headers: Vec<(String, String)> = Vec::new();
    let mut offset = 0;

    while offset < raw.len() {
        let end = raw[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| offset + i + 1)
            .unwrap_or(raw.len());
        let line = &raw[offset..end];
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        offset = end;

        if line.is_empty() {
            if headers.is_empty() {
                return Err(fail("message has no headers"));
            }
            return Ok((headers, offset));
        }

        let line = String::from_utf8_lossy(line);

        if line.starts_with([' ', '\t']) {
            let Some((_, value)) = headers.last_mut() else {
                return Err(fail("continuation line before first header"));
            };
            value.push(' ');
            value.push_str(line.trim());
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(fail(&format!("malformed header line: {line}")));
        };
        if name.is_empty() || name.bytes().any(|b| !b.is_ascii_graphic()) {
            return Err(fail(&format!("malformed header name: {name}")));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Err(fail("missing blank line between headers and body"))
}

/// Render every address in a header, comma separated.
fn join_addresses(addr: Option<&Address>) -> Option<String> {
    let list: Vec<String> = match addr? {
        Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    };
    (!list.is_empty()).then(|| list.join(", "))
}

/// Extract `addr` from `Name <addr>`; otherwise return the trimmed value.
pub fn clean_address(value: &str) -> String {
    let value = value.trim();
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>'))
        && start < end
    {
        return value[start + 1..end].trim().to_string();
    }
    value.to_string()
}

fn format_date(parsed: Option<&Message<'_>>, raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return UNKNOWN_DATE.to_string();
    };

    parsed
        .and_then(|m| m.date())
        .and_then(to_utc)
        .map(|d| d.format(DATE_FORMAT).to_string())
        .unwrap_or_else(|| {
            warn!(date = raw, "Failed to parse date, keeping original");
            raw.to_string()
        })
}

/// Convert a parsed header date to UTC, rejecting out-of-range fields
/// such as February 31st or hour 99.
fn to_utc(date: &mail_parser::DateTime) -> Option<DateTime<Utc>> {
    let local = NaiveDate::from_ymd_opt(
        i32::from(date.year),
        u32::from(date.month),
        u32::from(date.day),
    )?
    .and_hms_opt(
        u32::from(date.hour),
        u32::from(date.minute),
        u32::from(date.second),
    )?;

    let offset = i32::from(date.tz_hour) * 3600 + i32::from(date.tz_minute) * 60;
    let offset = if date.tz_before_gmt { -offset } else { offset };
    let offset = FixedOffset::east_opt(offset)?;

    local
        .and_local_timezone(offset)
        .single()
        .map(|d| d.with_timezone(&Utc))
}

/// First `text/plain` part of a multipart message, trailing whitespace trimmed.
fn multipart_text(parsed: Option<&Message<'_>>, raw_body: &[u8]) -> Option<String> {
    let plain = parsed.and_then(|m| {
        m.parts
            .iter()
            .skip(1)
            .filter(|part| is_plain_text(part))
            .find_map(|part| part.text_contents())
    });

    match plain {
        Some(text) => Some(text.replace("\r\n", "\n").trim_end().to_string()),
        None => {
            debug!("No text/plain part found, falling back to raw body");
            std::str::from_utf8(raw_body).ok().map(strip_leaked_headers)
        }
    }
}

fn is_plain_text(part: &MessagePart<'_>) -> bool {
    match part.content_type() {
        Some(ct) => {
            ct.ctype().eq_ignore_ascii_case("text")
                && ct.subtype().is_some_and(|s| s.eq_ignore_ascii_case("plain"))
        }
        None => matches!(part.body, PartType::Text(_)),
    }
}

/// Decoded body of a single-part message.
fn single_part_text(parsed: Option<&Message<'_>>, raw_body: &[u8]) -> Option<String> {
    if let Some(text) = parsed.and_then(|m| m.body_text(0)) {
        return Some(strip_leaked_headers(&text));
    }
    std::str::from_utf8(raw_body).ok().map(strip_leaked_headers)
}

/// Drop well-known MIME and transport header lines from the top of a body,
/// plus the blank line that ends them.
fn strip_leaked_headers(body: &str) -> String {
    let lines: Vec<&str> = body
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .collect();

    let mut start = lines
        .iter()
        .take_while(|l| LEAKED_HEADER.is_match(l.trim_start()))
        .count();
    if start > 0 && lines.get(start).is_some_and(|l| l.trim().is_empty()) {
        start += 1;
    }

    lines[start..].join("\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize_str(raw: &str) -> NormalizedMessage {
        normalize(raw.as_bytes()).unwrap()
    }

    // ── Headers ─────────────────────────────────────────────────────

    #[test]
    fn simple_message() {
        let msg = normalize_str(
            "From: Alice <alice@example.com>\r\n\
             To: 123456789@telegram\r\n\
             Subject: Test\r\n\
             Date: Mon, 02 Jan 2006 15:04:05 -0700\r\n\
             \r\n\
             hello\r\n",
        );
        assert_eq!(msg.from, "alice@example.com");
        assert_eq!(msg.to, "123456789@telegram");
        assert_eq!(msg.subject, "Test");
        assert_eq!(msg.date, "2006-01-02 22:04:05 UTC");
        assert_eq!(msg.body, "hello");
    }

    #[test]
    fn encoded_word_subject_is_decoded() {
        let msg = normalize_str(
            "From: a@b\nSubject: =?UTF-8?B?SGVsbG8gV8O2cmxk?=\n\nbody\n",
        );
        assert_eq!(msg.subject, "Hello Wörld");
    }

    #[test]
    fn folded_header_is_unfolded() {
        let raw = b"Subject: part one\r\n  part two\r\nFrom: a@b\r\n\r\nx\r\n";
        let (headers, offset) = split_headers(raw).unwrap();
        assert_eq!(
            headers,
            vec![
                ("Subject".to_string(), "part one part two".to_string()),
                ("From".to_string(), "a@b".to_string()),
            ]
        );
        assert_eq!(&raw[offset..], b"x\r\n");
    }

    #[test]
    fn multiple_recipients_are_joined() {
        let msg = normalize_str("To: A <a@x.com>, b@y.com\n\nx\n");
        assert_eq!(msg.to, "a@x.com, b@y.com");
    }

    #[test]
    fn missing_date_is_unknown() {
        assert_eq!(normalize_str("From: a@b\n\nx\n").date, "Unknown");
    }

    #[test]
    fn unparseable_date_is_kept_verbatim() {
        let msg = normalize_str("Date: sometime last week\n\nx\n");
        assert_eq!(msg.date, "sometime last week");
    }

    #[test]
    fn impossible_calendar_date_is_kept_verbatim() {
        let msg = normalize_str("Date: Tue, 31 Feb 2025 10:00:00 +0000\n\nx\n");
        assert_eq!(msg.date, "Tue, 31 Feb 2025 10:00:00 +0000");
    }

    #[test]
    fn out_of_range_time_is_kept_verbatim() {
        let msg = normalize_str("Date: Mon, 45 Foo 2024 99:99:99 +0000\n\nx\n");
        assert_eq!(msg.date, "Mon, 45 Foo 2024 99:99:99 +0000");
    }

    #[test]
    fn eastern_offset_is_converted_to_utc() {
        let msg = normalize_str("Date: Sat, 01 Mar 2025 01:30:00 +0200\n\nx\n");
        assert_eq!(msg.date, "2025-02-28 23:30:00 UTC");
    }

    #[test]
    fn malformed_encoded_word_subject_is_not_empty() {
        let msg = normalize_str("From: a@b\nSubject: =?UTF-8?Q?broken\n\nbody\n");
        assert!(!msg.subject.is_empty());
        assert!(msg.subject.contains("broken"));
    }

    #[test]
    fn subject_falls_back_to_raw_header_when_decoding_yields_nothing() {
        assert_eq!(pick_subject(None, Some("  =?x?Q?raw?= ")), "=?x?Q?raw?=");
        assert_eq!(pick_subject(Some("   "), Some("raw")), "raw");
        assert_eq!(pick_subject(Some(" Decoded "), Some("raw")), "Decoded");
        assert_eq!(pick_subject(None, None), "");
    }

    #[test]
    fn clean_address_forms() {
        assert_eq!(clean_address("  Bob <bob@example.com> "), "bob@example.com");
        assert_eq!(clean_address("bob@example.com"), "bob@example.com");
        assert_eq!(clean_address("weird > order <"), "weird > order <");
        assert_eq!(clean_address(""), "");
    }

    // ── Structure errors ────────────────────────────────────────────

    #[test]
    fn no_header_split_is_parse_failure() {
        for raw in [
            "",
            "just some text\n\nwith a blank line",
            "Subject: no body separator",
            "\nbody without headers",
            " leading continuation\n\nx",
        ] {
            let err = normalize(raw.as_bytes()).unwrap_err();
            assert!(matches!(err, DispatchError::ParseFailure(_)), "{raw:?}");
        }
    }

    #[test]
    fn empty_body_is_fine() {
        let msg = normalize_str("Subject: empty\n\n");
        assert_eq!(msg.subject, "empty");
        assert_eq!(msg.body, "");
    }

    // ── Body extraction ─────────────────────────────────────────────

    #[test]
    fn multipart_prefers_text_plain() {
        let raw = "From: a@b\r\n\
                   Subject: multi\r\n\
                   MIME-Version: 1.0\r\n\
                   Content-Type: multipart/alternative; boundary=\"XYZ\"\r\n\
                   \r\n\
                   --XYZ\r\n\
                   Content-Type: text/html; charset=utf-8\r\n\
                   \r\n\
                   <p>html version</p>\r\n\
                   --XYZ\r\n\
                   Content-Type: text/plain; charset=utf-8\r\n\
                   \r\n\
                   plain version\r\n\
                   second line  \r\n\
                   --XYZ--\r\n";
        let msg = normalize_str(raw);
        assert_eq!(msg.body, "plain version\nsecond line");
    }

    #[test]
    fn multipart_decodes_transfer_encoding() {
        let raw = "Content-Type: multipart/mixed; boundary=b1\n\
                   \n\
                   --b1\n\
                   Content-Type: text/plain\n\
                   Content-Transfer-Encoding: base64\n\
                   \n\
                   aGVsbG8gZnJvbSBiYXNlNjQ=\n\
                   --b1--\n";
        assert_eq!(normalize_str(raw).body, "hello from base64");
    }

    #[test]
    fn multipart_without_plain_falls_back_to_raw_body() {
        let raw = "Content-Type: multipart/mixed; boundary=b1\n\
                   \n\
                   --b1\n\
                   Content-Type: application/octet-stream\n\
                   \n\
                   AAAA\n\
                   --b1--\n";
        let body = normalize_str(raw).body;
        assert!(body.starts_with("--b1"), "{body}");
    }

    #[test]
    fn leaked_headers_are_stripped_from_single_part() {
        let raw = "Subject: s\n\n\
                   Content-Type: text/plain\n\
                   MIME-Version: 1.0\n\
                   Received: from somewhere\n\
                   \n\
                   actual text\n";
        assert_eq!(normalize_str(raw).body, "actual text");
    }

    #[test]
    fn ordinary_colon_lines_are_kept() {
        let raw = "Subject: s\n\nNote: meeting at 5\nBring snacks.\n";
        assert_eq!(normalize_str(raw).body, "Note: meeting at 5\nBring snacks.");
    }

    #[test]
    fn undecodable_body_gets_placeholder() {
        let mut raw = b"Subject: s\nContent-Type: multipart/mixed\n\n".to_vec();
        raw.extend_from_slice(&[0xff, 0xfe, 0xfd]);
        let msg = normalize(&raw).unwrap();
        assert_eq!(msg.body, BODY_PLACEHOLDER);
    }

    #[test]
    fn strip_leaked_headers_keeps_body_without_headers() {
        assert_eq!(strip_leaked_headers("line one\n\nline three\n"), "line one\n\nline three");
    }
}
