//! RFC 3164 (BSD syslog) decoding.
//!
//! `<PRI>Mmm dd hh:mm:ss HOSTNAME TAG: CONTENT`. Every header part is
//! optional; whatever cannot be recognised as header stays in the content.

use super::LogRecord;

const MONTHS: [&str; 12] =
    ["Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec"];

/// `Mmm dd hh:mm:ss`
const TIMESTAMP_LEN: usize = 15;

/// Decode one syslog datagram or frame.
pub fn parse_message(raw: &[u8]) -> LogRecord {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\n', '\r', '\0']);

    let (priority, rest) = split_priority(text);
    let mut record = LogRecord { priority, ..LogRecord::default() };

    let rest = match strip_timestamp(rest) {
        Some(after) => {
            let (hostname, after) = next_token(after);
            record.hostname = hostname.map(str::to_string);
            after
        }
        None => rest,
    };

    let rest = match next_token(rest) {
        (Some(token), after) if is_tag(token) => {
            record.tag = Some(token.trim_end_matches(':').to_string());
            after
        }
        _ => rest,
    };

    record.content = rest.trim().to_string();
    record
}

fn split_priority(text: &str) -> (Option<u8>, &str) {
    let Some(body) = text.strip_prefix('<') else {
        return (None, text);
    };
    let Some(end) = body.find('>') else {
        return (None, text);
    };
    // PRI is at most three digits, 0..=191
    match body.get(..end).and_then(|digits| {
        (1..=3).contains(&digits.len()).then(|| digits.parse::<u8>().ok()).flatten()
    }) {
        Some(priority) if priority <= 191 => (Some(priority), body.get(end + 1..).unwrap_or("")),
        _ => (None, text),
    }
}

fn strip_timestamp(text: &str) -> Option<&str> {
    let stamp = text.get(..TIMESTAMP_LEN)?;
    let bytes = stamp.as_bytes();
    let month_ok = stamp.get(..3).is_some_and(|m| MONTHS.contains(&m));
    let layout_ok = bytes.get(3) == Some(&b' ')
        && bytes.get(6) == Some(&b' ')
        && bytes.get(9) == Some(&b':')
        && bytes.get(12) == Some(&b':');
    let digits_ok = [5, 7, 8, 10, 11, 13, 14]
        .iter()
        .all(|&i| bytes.get(i).is_some_and(u8::is_ascii_digit));
    // day of month is space padded ("Oct  6")
    let day_ok = bytes.get(4).is_some_and(|b| *b == b' ' || b.is_ascii_digit());

    if month_ok && layout_ok && digits_ok && day_ok {
        Some(text.get(TIMESTAMP_LEN..).unwrap_or("").trim_start())
    } else {
        None
    }
}

fn next_token(text: &str) -> (Option<&str>, &str) {
    let text = text.trim_start();
    if text.is_empty() {
        return (None, text);
    }
    match text.find(char::is_whitespace) {
        Some(end) => (text.get(..end), text.get(end..).unwrap_or("")),
        None => (Some(text), ""),
    }
}

/// `nginx:` or `nginx[123]:`; a colon anywhere else rules out a tag, which
/// keeps IPv6 addresses such as `2001:db8::` in the content.
fn is_tag(token: &str) -> bool {
    let Some(name) = token.strip_suffix(':') else {
        return false;
    };
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '[' | ']'))
}
