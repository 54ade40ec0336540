use secrecy::{ExposeSecret, SecretString};

/// Access token pair for one authenticated user.
///
/// Produced once by the auth collaborator and handed to a single
/// connection session. Secret halves are redacted in `Debug` and zeroized
/// on drop.
#[derive(Clone)]
pub struct Credential {
    access_token: SecretString,
    access_secret: SecretString,
    user_id: Option<String>,
}

impl Credential {
    /// Build a credential, rejecting blank token halves.
    pub fn new(
        access_token: impl Into<String>,
        access_secret: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let access_token = access_token.into();
        let access_secret = access_secret.into();
        if access_token.trim().is_empty() {
            return Err(CredentialError::MissingToken);
        }
        if access_secret.trim().is_empty() {
            return Err(CredentialError::MissingSecret);
        }
        Ok(Self {
            access_token: SecretString::from(access_token),
            access_secret: SecretString::from(access_secret),
            user_id: None,
        })
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }

    pub fn access_secret(&self) -> &str {
        self.access_secret.expose_secret()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// The application's consumer key pair, used together with a [`Credential`]
/// to sign upstream requests.
#[derive(Clone)]
pub struct ConsumerKeys {
    pub key: String,
    pub secret: SecretString,
}

impl ConsumerKeys {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: SecretString::from(secret.into()),
        }
    }
}

impl std::fmt::Debug for ConsumerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerKeys")
            .field("key", &self.key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("access token is missing")]
    MissingToken,
    #[error("access secret is missing")]
    MissingSecret,
}
