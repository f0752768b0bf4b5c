use std::collections::HashMap;
use std::sync::Arc;

use subtle::ConstantTimeEq;

use crate::config::UserAccount;
use crate::models::{Credentials, Principal};

/// Known users, shared by HTTP basic auth and RPC authentication.
#[derive(Clone, Default)]
pub struct UserStore {
    users: Arc<HashMap<String, UserAccount>>,
}

impl UserStore {
    pub fn new(accounts: impl IntoIterator<Item = UserAccount>) -> Self {
        let users = accounts
            .into_iter()
            .map(|account| (account.username.clone(), account))
            .collect();
        Self {
            users: Arc::new(users),
        }
    }

    /// Check credentials, returning the matching principal.
    ///
    /// Unknown users still go through a password comparison so that response
    /// time does not reveal which usernames exist.
    pub fn authenticate(&self, credentials: &Credentials) -> Option<Principal> {
        match self.users.get(&credentials.username) {
            Some(account) if constant_time_eq(&credentials.password, &account.password) => {
                Some(Principal {
                    username: account.username.clone(),
                    roles: account.roles.clone(),
                })
            }
            Some(_) => None,
            None => {
                let _ = constant_time_eq(&credentials.password, &credentials.username);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Perform constant-time comparison of two strings.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn store() -> UserStore {
        UserStore::new(Config::default().auth_users)
    }

    #[test]
    fn test_authenticate_known_user() {
        let principal = store()
            .authenticate(&Credentials::new("rwinch", "pw"))
            .unwrap();

        assert_eq!(principal.username, "rwinch");
        assert!(principal.has_role("ADMIN"));
    }

    #[test]
    fn test_authenticate_wrong_password() {
        assert!(store().authenticate(&Credentials::new("jlong", "nope")).is_none());
    }

    #[test]
    fn test_authenticate_unknown_user() {
        assert!(store().authenticate(&Credentials::new("mallory", "pw")).is_none());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret123", "secret123"));
        assert!(!constant_time_eq("secret123", "secret456"));
        assert!(!constant_time_eq("short", "much-longer-string"));
    }
}
