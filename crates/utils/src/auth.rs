use std::{
    collections::HashMap,
    fmt::{self, Display},
    path::Path,
    str::FromStr,
    sync::Arc,
};

use base64::{engine::general_purpose, Engine as _};

/// Result type for authentication operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors that can occur while encoding or verifying SASL exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The provided credentials are invalid.
    InvalidCredentials,
    /// A SASL payload could not be decoded.
    MalformedPayload(String),
    /// The mechanism is not one of the supported ones.
    UnsupportedMechanism(String),
}

impl Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::InvalidCredentials => write!(f, "Invalid credentials"),
            AuthError::MalformedPayload(msg) => write!(f, "Malformed SASL payload: {msg}"),
            AuthError::UnsupportedMechanism(name) => {
                write!(f, "Unsupported authentication mechanism: {name}")
            }
        }
    }
}

impl std::error::Error for AuthError {}

/// SASL mechanisms spoken by both the client and the capture server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// RFC 4616, `\0username\0password` in a single base64 response.
    Plain,
    /// Username and password sent in two base64 challenge rounds.
    Login,
}

impl Mechanism {
    /// Preference order used by the client when several are advertised.
    pub const PREFERRED: [Mechanism; 2] = [Mechanism::Plain, Mechanism::Login];

    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::Login => "LOGIN",
        }
    }

    /// Picks the first preferred mechanism among the advertised ones.
    pub fn select(advertised: &[String]) -> Option<Mechanism> {
        Self::PREFERRED.into_iter().find(|mechanism| {
            advertised
                .iter()
                .any(|name| name.eq_ignore_ascii_case(mechanism.name()))
        })
    }
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Mechanism {
    type Err = AuthError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(Mechanism::Plain),
            "LOGIN" => Ok(Mechanism::Login),
            other => Err(AuthError::UnsupportedMechanism(other.to_string())),
        }
    }
}

/// Encodes the `AUTH PLAIN` initial response.
///
/// # Examples
///
/// ```rust
/// assert_eq!(mailpost_utils::encode_plain("user", "password"), "AHVzZXIAcGFzc3dvcmQ=");
/// ```
pub fn encode_plain(username: &str, password: &str) -> String {
    general_purpose::STANDARD.encode(format!("\0{username}\0{password}"))
}

/// Decodes an `AUTH PLAIN` response into its username and password,
/// ignoring the authorization identity.
pub fn decode_plain(payload: &str) -> AuthResult<(String, String)> {
    let bytes = general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| AuthError::MalformedPayload(e.to_string()))?;
    let mut fields = bytes.split(|byte| *byte == 0);
    let (_, username, password) = match (fields.next(), fields.next(), fields.next()) {
        (Some(authzid), Some(username), Some(password)) => (authzid, username, password),
        _ => return Err(AuthError::MalformedPayload("expected 3 fields".to_string())),
    };
    if username.is_empty() {
        return Err(AuthError::MalformedPayload("empty username".to_string()));
    }
    Ok((
        String::from_utf8_lossy(username).into_owned(),
        String::from_utf8_lossy(password).into_owned(),
    ))
}

/// Base64 encodes a single `AUTH LOGIN` round (username or password).
pub fn encode_login_step(value: &str) -> String {
    general_purpose::STANDARD.encode(value)
}

/// Decodes a single `AUTH LOGIN` round.
pub fn decode_login_step(payload: &str) -> AuthResult<String> {
    let bytes = general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| AuthError::MalformedPayload(e.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Trait for credential verification backends.
pub trait AuthEngine: Send + Sync {
    /// Returns `Ok(true)` if the password matches the stored one.
    fn authenticate(&self, username: &str, password: &str) -> AuthResult<bool>;
}

/// In-memory credential store, shared cheaply between connections.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuthEngine {
    credentials: Arc<HashMap<String, String>>,
}

impl MemoryAuthEngine {
    pub fn from_map(credentials: HashMap<String, String>) -> Self {
        Self {
            credentials: Arc::new(credentials),
        }
    }

    /// Parses `username:password` lines, ignoring blank lines and lines
    /// without a separator.
    pub fn parse(content: &str) -> Self {
        let credentials = content
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(user, pass)| (user.trim().to_string(), pass.trim().to_string()))
            .filter(|(user, _)| !user.is_empty())
            .collect();
        Self::from_map(credentials)
    }

    /// Loads credentials from a `username:password` per line file.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn with_user(username: &str, password: &str) -> Self {
        Self::from_map(HashMap::from([(username.to_string(), password.to_string())]))
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

impl AuthEngine for MemoryAuthEngine {
    fn authenticate(&self, username: &str, password: &str) -> AuthResult<bool> {
        Ok(self
            .credentials
            .get(username)
            .is_some_and(|stored| stored == password))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_roundtrip() {
        let encoded = encode_plain("user", "secret");
        assert_eq!(
            decode_plain(&encoded).unwrap(),
            ("user".to_string(), "secret".to_string())
        );
    }

    #[test]
    fn test_decode_plain_errors() {
        assert!(matches!(
            decode_plain("!!!"),
            Err(AuthError::MalformedPayload(_))
        ));
        let missing = general_purpose::STANDARD.encode("user");
        assert!(decode_plain(&missing).is_err());
        let empty_user = general_purpose::STANDARD.encode("\0\0password");
        assert!(decode_plain(&empty_user).is_err());
    }

    #[test]
    fn test_login_steps() {
        assert_eq!(encode_login_step("Username:"), "VXNlcm5hbWU6");
        assert_eq!(decode_login_step("UGFzc3dvcmQ6").unwrap(), "Password:");
    }

    #[test]
    fn test_mechanism_select_prefers_plain() {
        let advertised = vec!["LOGIN".to_string(), "PLAIN".to_string()];
        assert_eq!(Mechanism::select(&advertised), Some(Mechanism::Plain));
        assert_eq!(
            Mechanism::select(&["login".to_string()]),
            Some(Mechanism::Login)
        );
        assert_eq!(Mechanism::select(&["CRAM-MD5".to_string()]), None);
    }

    #[test]
    fn test_mechanism_from_str() {
        assert_eq!("plain".parse::<Mechanism>().unwrap(), Mechanism::Plain);
        assert_eq!(
            "XOAUTH2".parse::<Mechanism>(),
            Err(AuthError::UnsupportedMechanism("XOAUTH2".to_string()))
        );
    }

    #[test]
    fn test_memory_engine_parse() {
        let engine = MemoryAuthEngine::parse("user1:pass1\n\nbroken\n user2 : pass2 \n");
        assert_eq!(engine.len(), 2);
        assert!(engine.authenticate("user1", "pass1").unwrap());
        assert!(engine.authenticate("user2", "pass2").unwrap());
        assert!(!engine.authenticate("user1", "wrong").unwrap());
        assert!(!engine.authenticate("nobody", "pass1").unwrap());
    }

    #[test]
    fn test_memory_engine_from_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("users.txt");
        std::fs::write(&path, "alice:wonderland\n").unwrap();

        let engine = MemoryAuthEngine::from_file(&path).unwrap();
        assert!(engine.authenticate("alice", "wonderland").unwrap());
        assert!(MemoryAuthEngine::from_file(temp_dir.path().join("none.txt")).is_err());
    }

    #[test]
    fn test_auth_error_display() {
        assert_eq!(
            AuthError::InvalidCredentials.to_string(),
            "Invalid credentials"
        );
        assert_eq!(
            AuthError::UnsupportedMechanism("X".to_string()).to_string(),
            "Unsupported authentication mechanism: X"
        );
    }
}
