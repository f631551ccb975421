//! Per-connection authentication state

use crate::error::{KvError, Result};

/// Authentication state of one connection
#[derive(Debug, Clone)]
pub struct AuthSession {
    /// Expected (user, password); `None` means authentication is off
    required: Option<(String, String)>,
    authenticated: bool,
}

impl AuthSession {
    pub fn new(required: Option<(String, String)>) -> Self {
        Self {
            required,
            authenticated: false,
        }
    }

    /// Whether commands other than AUTH may run
    pub fn is_active(&self) -> bool {
        self.required.is_none() || self.authenticated
    }

    /// Check credentials and activate the session on success
    pub fn validate(&mut self, user: &str, pass: &str) -> Result<()> {
        let Some((expected_user, expected_pass)) = &self.required else {
            return Err(KvError::Auth(
                "AUTH called without any password configured".into(),
            ));
        };
        if user == expected_user && pass == expected_pass {
            self.authenticated = true;
            Ok(())
        } else {
            self.authenticated = false;
            Err(KvError::Auth("invalid username-password pair".into()))
        }
    }

    /// Drop back to unauthenticated
    pub fn expire(&mut self) {
        self.authenticated = false;
    }
}
