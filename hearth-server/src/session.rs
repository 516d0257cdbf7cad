//! Signed-cookie sessions

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use cookie::{Cookie, CookieJar, Key, SameSite};
use hyper::header::{HeaderMap, HeaderValue, COOKIE};
use serde_json::{Map, Value};
use sha2::{Digest, Sha512};
use tracing::debug;

pub const SESSION_COOKIE: &str = "session";

/// Thirty days, in seconds.
const SESSION_MAX_AGE: i64 = 86400 * 30;

const FLASHES_KEY: &str = "_flash";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("session payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("session cookie is not a valid header value")]
    Header(#[from] hyper::header::InvalidHeaderValue),
}

/// Per-visitor key/value store carried in the session cookie.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    values: Map<String, Value>,
    fresh: bool,
}

impl Session {
    /// A session with no cookie behind it.
    pub fn new() -> Self {
        Self {
            values: Map::new(),
            fresh: true,
        }
    }

    /// True when the request carried no valid session cookie.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Queue a one-shot message for the next page view.
    pub fn add_flash(&mut self, message: impl Into<String>) {
        let entry = self
            .values
            .entry(FLASHES_KEY)
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = entry {
            list.push(Value::String(message.into()));
        }
    }

    /// Take every queued flash message.
    pub fn take_flashes(&mut self) -> Vec<String> {
        match self.values.remove(FLASHES_KEY) {
            Some(Value::Array(list)) => list
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Encodes sessions into signed `Set-Cookie` headers and back.
#[derive(Clone)]
pub struct SessionCodec {
    key: Key,
    secure: bool,
}

impl SessionCodec {
    /// The signing key is derived from `secret`, so any non-empty secret
    /// yields a full-strength key.
    pub fn new(secret: &str, secure: bool) -> Self {
        let digest = Sha512::digest(secret.as_bytes());
        Self {
            key: Key::from(digest.as_slice()),
            secure,
        }
    }

    /// Read the session from the request's `Cookie` headers.
    ///
    /// A missing, unsigned or tampered cookie yields a fresh session. A
    /// correctly signed cookie whose payload does not decode is an error.
    pub fn decode(&self, headers: &HeaderMap) -> Result<Session, SessionError> {
        let mut jar = CookieJar::new();
        for header in headers.get_all(COOKIE) {
            let Ok(raw) = header.to_str() else {
                continue;
            };
            for cookie in Cookie::split_parse(raw).flatten() {
                if cookie.name() == SESSION_COOKIE {
                    jar.add_original(cookie.into_owned());
                }
            }
        }

        if jar.get(SESSION_COOKIE).is_none() {
            return Ok(Session::new());
        }
        let Some(verified) = jar.signed(&self.key).get(SESSION_COOKIE) else {
            debug!("Ignoring session cookie with a bad signature");
            return Ok(Session::new());
        };

        let payload = URL_SAFE_NO_PAD.decode(verified.value())?;
        let values: Map<String, Value> = serde_json::from_slice(&payload)?;
        Ok(Session {
            values,
            fresh: false,
        })
    }

    /// Build the signed `Set-Cookie` header for `session`.
    pub fn encode(&self, session: &Session) -> Result<HeaderValue, SessionError> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&session.values)?);

        let cookie = Cookie::build((SESSION_COOKIE, payload))
            .path("/")
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .max_age(cookie::time::Duration::seconds(SESSION_MAX_AGE))
            .build();

        let mut jar = CookieJar::new();
        jar.signed_mut(&self.key).add(cookie);
        let signed = jar
            .get(SESSION_COOKIE)
            .map(|c| c.to_string())
            .unwrap_or_default();
        Ok(HeaderValue::from_str(&signed)?)
    }
}

impl std::fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCodec")
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_headers(set_cookie: &HeaderValue) -> HeaderMap {
        // Browsers send back only the name=value pair
        let pair = set_cookie.to_str().unwrap().split(';').next().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(pair).unwrap());
        headers
    }

    #[test]
    fn test_missing_cookie_gives_fresh_session() {
        let codec = SessionCodec::new("secret", false);
        let session = codec.decode(&HeaderMap::new()).unwrap();
        assert!(session.is_fresh());
        assert_eq!(session, Session::new());
    }

    #[test]
    fn test_encoded_session_decodes() {
        let codec = SessionCodec::new("secret", false);
        let mut session = Session::new();
        session.insert("user", "42");
        session.insert("name", "dave");

        let header = codec.encode(&session).unwrap();
        let text = header.to_str().unwrap();
        assert!(text.starts_with("session="));
        assert!(text.contains("HttpOnly"));
        assert!(text.contains("Path=/"));

        let decoded = codec.decode(&request_headers(&header)).unwrap();
        assert!(!decoded.is_fresh());
        assert_eq!(decoded.get_str("user"), Some("42"));
        assert_eq!(decoded.get_str("name"), Some("dave"));
    }

    #[test]
    fn test_cookie_signed_with_other_secret_is_ignored() {
        let ours = SessionCodec::new("secret", false);
        let theirs = SessionCodec::new("other", false);
        let mut session = Session::new();
        session.insert("user", "1");

        let forged = theirs.encode(&session).unwrap();
        let decoded = ours.decode(&request_headers(&forged)).unwrap();
        assert!(decoded.is_fresh());
        assert_eq!(decoded.get("user"), None);
    }

    #[test]
    fn test_unsigned_cookie_is_ignored() {
        let codec = SessionCodec::new("secret", false);
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; session=e30"));
        let decoded = codec.decode(&headers).unwrap();
        assert!(decoded.is_fresh());
    }

    #[test]
    fn test_flashes_are_taken_once() {
        let mut session = Session::new();
        session.add_flash("Invalid Username/Password");
        session.add_flash("Try again");
        assert_eq!(
            session.take_flashes(),
            vec!["Invalid Username/Password", "Try again"]
        );
        assert!(session.take_flashes().is_empty());
    }

    #[test]
    fn test_secure_flag() {
        let codec = SessionCodec::new("secret", true);
        let header = codec.encode(&Session::new()).unwrap();
        assert!(header.to_str().unwrap().contains("Secure"));
    }
}
