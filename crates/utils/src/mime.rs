use base64::{engine::general_purpose, Engine as _};

/// Maximum number of octets in a line of a `7bit` body (RFC 5322 §2.1.1).
pub const MAX_LINE_LENGTH: usize = 998;

/// Number of base64 characters per encoded line (RFC 2045 §6.8).
pub const BASE64_LINE_LENGTH: usize = 76;

/// Maximum number of raw bytes carried by a single RFC 2047 encoded word,
/// 45 bytes encode into 60 base64 characters which, together with the
/// `=?utf-8?b?` prefix and `?=` suffix, stays below the 75 character limit.
const ENCODED_WORD_BYTES: usize = 45;

/// Checks whether a raw email contains a `MIME-Version:` header,
/// indicating it is a MIME message per RFC 2045.
///
/// Only the header section (lines before the first blank line) is inspected.
///
/// # Examples
///
/// ```rust
/// assert!(mailpost_utils::is_mime_valid(
///     "MIME-Version: 1.0\r\nContent-Type: text/plain\r\n\r\nBody"
/// ));
/// assert!(!mailpost_utils::is_mime_valid("Subject: Hello\r\n\r\nMIME-Version: 1.0"));
/// ```
pub fn is_mime_valid(raw: &str) -> bool {
    let (headers, _) = parse_raw_headers(raw);
    header_value(&headers, "MIME-Version").is_some()
}

/// Parses headers from a raw email, returning an ordered list of headers
/// and a reference to the content after the blank-line separator.
///
/// Folded header lines (starting with a space or a tab) are unfolded into
/// the previous header value.
///
/// # Examples
///
/// ```rust
/// let (headers, content) = mailpost_utils::parse_raw_headers(
///     "From: alice@example.com\r\nSubject: a\r\n b\r\n\r\nHello!"
/// );
/// assert_eq!(headers.len(), 2);
/// assert_eq!(headers[1], ("Subject".to_string(), "a b".to_string()));
/// assert_eq!(content, "Hello!");
/// ```
pub fn parse_raw_headers(raw: &str) -> (Vec<(String, String)>, &str) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut pos = 0;

    for line in raw.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.trim().is_empty() {
            pos += line.len();
            break;
        }

        if trimmed.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(trimmed.trim());
                pos += line.len();
                continue;
            }
        }

        match trimmed.split_once(':') {
            Some((key, value)) => headers.push((key.trim().to_string(), value.trim().to_string())),
            // not a header line, the content starts here
            None => break,
        }
        pos += line.len();
    }

    (headers, &raw[pos..])
}

/// Returns the first header value matching `name` (case-insensitive).
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Encodes a header value for transmission.
///
/// ASCII values are returned verbatim, anything else is turned into a
/// sequence of RFC 2047 base64 encoded words folded with `CRLF SP`, never
/// splitting a UTF-8 character across two words.
///
/// # Examples
///
/// ```rust
/// assert_eq!(mailpost_utils::encode_header_value("Hi"), "Hi");
/// assert_eq!(
///     mailpost_utils::encode_header_value("欠席連絡"),
///     "=?utf-8?b?5qyg5bit6YCj57Wh?="
/// );
/// ```
pub fn encode_header_value(value: &str) -> String {
    if value.is_ascii() && !value.contains(['\r', '\n']) {
        return value.to_string();
    }

    let mut words = Vec::new();
    let mut chunk = String::with_capacity(ENCODED_WORD_BYTES);
    for c in value.chars().filter(|c| *c != '\r' && *c != '\n') {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_BYTES {
            words.push(encoded_word(&chunk));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(encoded_word(&chunk));
    }
    words.join("\r\n ")
}

fn encoded_word(chunk: &str) -> String {
    format!("=?utf-8?b?{}?=", general_purpose::STANDARD.encode(chunk))
}

/// Builds the `filename` parameter of a `Content-Disposition` header.
///
/// Plain ASCII names use the quoted-string form, other names use the
/// RFC 2231 extended form with percent-encoded UTF-8.
///
/// # Examples
///
/// ```rust
/// assert_eq!(mailpost_utils::filename_param("file.txt"), "filename=\"file.txt\"");
/// assert_eq!(mailpost_utils::filename_param("é.png"), "filename*=utf-8''%C3%A9.png");
/// ```
pub fn filename_param(name: &str) -> String {
    if name.is_ascii() && !name.chars().any(|c| c.is_ascii_control()) {
        let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
        return format!("filename=\"{escaped}\"");
    }

    let mut encoded = String::with_capacity(name.len() * 3);
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("filename*=utf-8''{encoded}")
}

/// Base64 encodes the data, splitting the output in CRLF terminated lines
/// of [`BASE64_LINE_LENGTH`] characters.
///
/// # Examples
///
/// ```rust
/// assert_eq!(mailpost_utils::wrap_base64(b"hello"), "aGVsbG8=\r\n");
/// assert_eq!(mailpost_utils::wrap_base64(b""), "");
/// ```
pub fn wrap_base64(data: &[u8]) -> String {
    let encoded = general_purpose::STANDARD.encode(data);
    let mut wrapped = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE_LENGTH * 2 + 2);
    for line in encoded.as_bytes().chunks(BASE64_LINE_LENGTH) {
        // base64 output is pure ASCII, chunking by bytes is safe
        wrapped.push_str(std::str::from_utf8(line).unwrap_or_default());
        wrapped.push_str("\r\n");
    }
    wrapped
}

/// Normalizes every line ending to CRLF, guaranteeing that a non-empty
/// text ends with a line break.
///
/// # Examples
///
/// ```rust
/// assert_eq!(mailpost_utils::normalize_crlf("a\nb\r\nc"), "a\r\nb\r\nc\r\n");
/// ```
pub fn normalize_crlf(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len() + 16);
    for line in text.lines() {
        normalized.push_str(line);
        normalized.push_str("\r\n");
    }
    normalized
}

/// Whether the text can't travel as `7bit` and must be base64 encoded.
pub fn requires_base64(text: &str) -> bool {
    !text.is_ascii() || text.lines().any(|line| line.len() > MAX_LINE_LENGTH)
}

/// Whether the value holds a CR, LF or any other control character and
/// so can't be placed on a single header or command line.
///
/// # Examples
///
/// ```rust
/// assert!(mailpost_utils::has_control_chars("a@x.com>\r\nRCPT TO:<b@x.com"));
/// assert!(!mailpost_utils::has_control_chars("Jane <jane@example.com>"));
/// ```
pub fn has_control_chars(value: &str) -> bool {
    value.chars().any(char::is_control)
}
