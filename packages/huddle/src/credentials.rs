//! Credential lookups.
//!
//! The client never owns credentials; it asks for them each time it dials.

/// Supplies the bearer token and the current user id.
pub trait CredentialSource: Send + Sync {
    /// Bearer token, if one is available. Empty strings count as absent.
    fn token(&self) -> Option<String>;

    fn current_user_id(&self) -> String;
}

/// Fixed credentials, e.g. from a command-line flag.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    token: Option<String>,
    user_id: String,
}

impl StaticCredentials {
    pub fn new(token: Option<String>, user_id: impl Into<String>) -> Self {
        Self {
            token,
            user_id: user_id.into(),
        }
    }

    /// No token at all; connecting with these always fails with `CredentialMissing`.
    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl CredentialSource for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.token.clone().filter(|t| !t.trim().is_empty())
    }

    fn current_user_id(&self) -> String {
        self.user_id.clone()
    }
}

/// Reads credentials from environment variables on every lookup, so a token
/// exported after startup is picked up by the next reconnect.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    token_var: String,
    user_var: String,
}

impl EnvCredentials {
    pub fn new(token_var: impl Into<String>, user_var: impl Into<String>) -> Self {
        Self {
            token_var: token_var.into(),
            user_var: user_var.into(),
        }
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new("HUDDLE_TOKEN", "HUDDLE_USER_ID")
    }
}

impl CredentialSource for EnvCredentials {
    fn token(&self) -> Option<String> {
        std::env::var(&self.token_var)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }

    fn current_user_id(&self) -> String {
        std::env::var(&self.user_var).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_token_counts_as_missing() {
        let creds = StaticCredentials::new(Some("  ".into()), "u1");
        assert_eq!(creds.token(), None);
        assert_eq!(creds.current_user_id(), "u1");
    }

    #[test]
    fn anonymous_has_no_token() {
        assert_eq!(StaticCredentials::anonymous().token(), None);
    }

    #[test]
    fn static_token_is_returned() {
        let creds = StaticCredentials::new(Some("abc".into()), "u1");
        assert_eq!(creds.token().as_deref(), Some("abc"));
    }

    #[test]
    fn env_credentials_missing_variable() {
        let creds = EnvCredentials::new("HUDDLE_TEST_TOKEN_THAT_IS_NEVER_SET", "HUDDLE_TEST_USER_NEVER_SET");
        assert_eq!(creds.token(), None);
        assert_eq!(creds.current_user_id(), "");
    }
}
