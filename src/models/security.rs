use std::fmt;

use serde::{Deserialize, Serialize};

/// Username/password pair sent by clients (HTTP basic auth or RPC metadata).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Keep passwords out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// An authenticated user.
///
/// Inserted into request extensions by the basic auth middleware and handed
/// to RPC route handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("jlong", "secret");
        let debug = format!("{creds:?}");

        assert!(debug.contains("jlong"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_principal_has_role() {
        let principal = Principal {
            username: "rwinch".to_string(),
            roles: vec!["ADMIN".to_string(), "USER".to_string()],
        };

        assert!(principal.has_role("admin"));
        assert!(!principal.has_role("ROOT"));
    }
}
