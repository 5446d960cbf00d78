use std::fmt::{self, Display};

/// A complete, possibly multi-line, SMTP server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The three digit reply code.
    pub code: u16,
    /// Text of every reply line, without the code and separator.
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, message: &str) -> Self {
        Self {
            code,
            lines: vec![message.to_string()],
        }
    }

    /// Parses the raw reply lines (as read from the wire).
    ///
    /// Every line must start with the same three digit code, followed
    /// by `-` for continuation lines and by a space (or nothing) for the
    /// last one.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let reply = mailpost_utils::Reply::parse("250-localhost\r\n250 STARTTLS\r\n").unwrap();
    /// assert_eq!(reply.code, 250);
    /// assert_eq!(reply.lines, vec!["localhost", "STARTTLS"]);
    /// ```
    pub fn parse(raw: &str) -> Option<Self> {
        let mut code = None;
        let mut lines = Vec::new();

        for line in raw.lines() {
            let current = line.get(..3)?.parse::<u16>().ok()?;
            if *code.get_or_insert(current) != current {
                return None;
            }
            lines.push(line.get(4..).unwrap_or_default().to_string());
        }

        Some(Self { code: code?, lines })
    }

    /// Whether a raw line is the last line of a reply.
    pub fn is_last_line(line: &str) -> bool {
        line.as_bytes().get(3).map_or(true, |separator| *separator != b'-')
    }

    /// Positive completion reply (2xx).
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Positive intermediate reply (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Transient (4xx) or permanent (5xx) negative reply.
    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    /// Reply text, lines joined by a single space.
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message())
    }
}

/// Extensions advertised by the server in its `EHLO` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Greeting line of the `EHLO` reply, usually the server name.
    pub server_name: String,
    extensions: Vec<(String, Vec<String>)>,
}

impl Capabilities {
    /// Extracts the capabilities from an `EHLO` reply, the first line is
    /// the greeting and each following line an extension keyword with its
    /// optional parameters.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let reply = mailpost_utils::Reply::parse(
    ///     "250-localhost greets you\r\n250-STARTTLS\r\n250 AUTH PLAIN LOGIN\r\n"
    /// ).unwrap();
    /// let capabilities = mailpost_utils::Capabilities::from_reply(&reply);
    /// assert!(capabilities.supports("starttls"));
    /// assert_eq!(capabilities.auth_mechanisms(), vec!["PLAIN", "LOGIN"]);
    /// ```
    pub fn from_reply(reply: &Reply) -> Self {
        let mut lines = reply.lines.iter();
        let server_name = lines.next().cloned().unwrap_or_default();
        let extensions = lines
            .filter_map(|line| {
                // some servers still use the legacy `AUTH=LOGIN` syntax
                let mut words = line.split(|c: char| c.is_whitespace() || c == '=');
                let keyword = words.next()?.trim().to_ascii_uppercase();
                if keyword.is_empty() {
                    return None;
                }
                let params = words
                    .filter(|word| !word.is_empty())
                    .map(|word| word.to_ascii_uppercase())
                    .collect();
                Some((keyword, params))
            })
            .collect();
        Self {
            server_name,
            extensions,
        }
    }

    /// Whether the extension keyword was advertised (case-insensitive).
    pub fn supports(&self, keyword: &str) -> bool {
        self.extensions
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(keyword))
    }

    /// Authentication mechanisms advertised through the `AUTH` extension.
    pub fn auth_mechanisms(&self) -> Vec<String> {
        let mut mechanisms: Vec<String> = Vec::new();
        for (_, params) in self.extensions.iter().filter(|(name, _)| name == "AUTH") {
            for param in params {
                if !mechanisms.contains(param) {
                    mechanisms.push(param.clone());
                }
            }
        }
        mechanisms
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_line() {
        let reply = Reply::parse("220 localhost Mailpost ready\r\n").unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.message(), "localhost Mailpost ready");
        assert!(reply.is_positive());
    }

    #[test]
    fn test_parse_code_only() {
        let reply = Reply::parse("250\r\n").unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines, vec![""]);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Reply::parse("hello\r\n").is_none());
        assert!(Reply::parse("").is_none());
        assert!(Reply::parse("250-a\r\n354 b\r\n").is_none());
    }

    #[test]
    fn test_reply_classes() {
        assert!(Reply::new(354, "go ahead").is_intermediate());
        assert!(Reply::new(451, "later").is_error());
        assert!(Reply::new(535, "denied").is_error());
        assert!(!Reply::new(250, "ok").is_error());
    }

    #[test]
    fn test_is_last_line() {
        assert!(!Reply::is_last_line("250-STARTTLS\r\n"));
        assert!(Reply::is_last_line("250 OK\r\n"));
        assert!(Reply::is_last_line("250\r\n"));
    }

    #[test]
    fn test_capabilities_legacy_auth_syntax() {
        let reply = Reply::parse("250-mx\r\n250-AUTH=LOGIN\r\n250 AUTH LOGIN PLAIN\r\n").unwrap();
        let capabilities = Capabilities::from_reply(&reply);
        assert_eq!(capabilities.server_name, "mx");
        assert_eq!(capabilities.auth_mechanisms(), vec!["LOGIN", "PLAIN"]);
        assert!(!capabilities.supports("STARTTLS"));
    }

    #[test]
    fn test_capabilities_helo_reply() {
        let capabilities = Capabilities::from_reply(&Reply::new(250, "Hello"));
        assert!(capabilities.is_empty());
        assert!(capabilities.auth_mechanisms().is_empty());
    }
}
