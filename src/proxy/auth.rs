//! Static shared-secret gate for `Proxy-Authorization`.

use std::fmt;

use base64::Engine as _;

/// Header the gate inspects.
pub const PROXY_AUTHORIZATION: &str = "proxy-authorization";

/// Challenge sent with a 407.
pub const PROXY_AUTHENTICATE_CHALLENGE: &str = "Basic realm=\"Proxy\"";

/// Precomputed `Proxy-Authorization` token. Empty means auth is off.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    token: String,
}

impl Credential {
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// `Basic base64(username:password)`, or disabled unless both are non-empty.
    #[must_use]
    pub fn basic(username: &str, password: &str) -> Self {
        if username.is_empty() || password.is_empty() {
            return Self::disabled();
        }
        Self {
            token: format!("Basic {}", login_to_base64(username, password)),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.token.is_empty()
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Check the first `Proxy-Authorization` value presented by a request.
    #[must_use]
    pub fn authenticate(&self, presented: Option<&[u8]>) -> bool {
        authenticate(presented, self.token.as_bytes())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Byte-exact comparison; an empty expected token accepts everything.
#[must_use]
pub fn authenticate(presented: Option<&[u8]>, expected: &[u8]) -> bool {
    if expected.is_empty() {
        return true;
    }
    presented == Some(expected)
}

#[must_use]
pub fn login_to_base64(username: &str, password: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"))
}
