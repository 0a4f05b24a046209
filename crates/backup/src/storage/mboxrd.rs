//! mboxrd message envelope
//!
//! Each message in the body log looks like:
//!
//! ```text
//! From sender@example.com Tue Jan  3 10:00:00 2023
//! <headers and body, LF line endings, "From " lines quoted>
//! <blank separator line>
//! ```
//!
//! Any line matching `^>*From ` gets one extra leading `>` so that it cannot
//! be mistaken for an envelope line. Reading strips exactly one `>` again.

use chrono::DateTime;

const ENVELOPE: &[u8] = b"From ";

/// Serialize a raw message into its mboxrd form
pub fn serialize(message: &[u8]) -> Vec<u8> {
    let (from, date) = envelope_fields(message);

    let mut out = Vec::with_capacity(message.len() + 64);
    out.extend_from_slice(ENVELOPE);
    out.extend_from_slice(from.as_bytes());
    out.push(b' ');
    out.extend_from_slice(date.as_bytes());
    out.push(b'\n');

    let normalized = crlf_to_lf(message);
    for line in lines(&normalized) {
        if is_quotable(line) {
            out.push(b'>');
        }
        out.extend_from_slice(line);
    }
    if !out.ends_with(b"\n") {
        out.push(b'\n');
    }
    out.push(b'\n');
    out
}

/// Recover the message stored in one mboxrd entry
///
/// Line endings are returned as LF.
pub fn deserialize(serialized: &[u8]) -> Vec<u8> {
    let body = match serialized.iter().position(|&b| b == b'\n') {
        Some(pos) if serialized.starts_with(ENVELOPE) => &serialized[pos + 1..],
        _ => serialized,
    };
    let body = body.strip_suffix(b"\n").unwrap_or(body);

    let mut out = Vec::with_capacity(body.len());
    for line in lines(body) {
        if line.first() == Some(&b'>') && is_quotable(line) {
            out.extend_from_slice(&line[1..]);
        } else {
            out.extend_from_slice(line);
        }
    }
    out
}

/// Whether a serialized entry starts with an envelope line
pub fn has_envelope(serialized: &[u8]) -> bool {
    serialized.starts_with(ENVELOPE)
}

/// Lines including their terminating newline
fn lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split_inclusive(|&b| b == b'\n')
}

fn is_quotable(line: &[u8]) -> bool {
    let unquoted = line.iter().position(|&b| b != b'>').unwrap_or(line.len());
    line[unquoted..].starts_with(ENVELOPE)
}

fn crlf_to_lf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(b);
    }
    out
}

/// Sender address and asctime-style date for the envelope line
fn envelope_fields(message: &[u8]) -> (String, String) {
    let header_end = find_header_end(message);
    let headers = String::from_utf8_lossy(&message[..header_end]);

    let mut from = String::new();
    let mut date = String::new();

    for (name, value) in unfolded_headers(&headers) {
        if name.eq_ignore_ascii_case("from") && from.is_empty() {
            from = extract_address(&value);
        } else if name.eq_ignore_ascii_case("date") && date.is_empty() {
            date = DateTime::parse_from_rfc2822(value.trim())
                .map(|d| d.format("%a %b %e %H:%M:%S %Y").to_string())
                .unwrap_or_default();
        }
    }

    (from, date)
}

fn find_header_end(message: &[u8]) -> usize {
    let lf = message.windows(2).position(|w| w == b"\n\n");
    let crlf = message.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => message.len(),
    }
}

fn unfolded_headers(headers: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();
    for line in headers.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = result.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            result.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    result
}

fn extract_address(value: &str) -> String {
    if let (Some(start), Some(end)) = (value.find('<'), value.rfind('>')) {
        if start < end {
            return value[start + 1..end].trim().to_string();
        }
    }
    value
        .split_whitespace()
        .find(|token| token.contains('@'))
        .or_else(|| value.split_whitespace().next())
        .unwrap_or_default()
        .to_string()
}
