use std::fmt;

use async_trait::async_trait;
use time::OffsetDateTime;

/// CBS token type for shared-access signatures.
pub const SAS_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";

/// CBS token type for JSON web tokens issued by an identity provider.
pub const JWT_TOKEN_TYPE: &str = "jwt";

/// Error produced by a [`TokenCredential`].
pub type CredentialError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An authorization token together with its stated expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Raw token value delivered to the service.
    pub token: String,
    /// Expiry of the token in UTC, as stated by its issuer.
    pub expires_at_utc: OffsetDateTime,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at_utc", &self.expires_at_utc)
            .finish()
    }
}

/// Source of authorization tokens for the scope's endpoint.
///
/// Supplied by the caller; the scope only requests tokens through it, passing
/// the endpoint URI as the requested resource. Requests still in flight when
/// the operation is cancelled or the scope is disposed are abandoned by drop.
#[async_trait]
pub trait TokenCredential: fmt::Debug + Send + Sync {
    /// Requests a token valid for `resource`.
    async fn get_token(&self, resource: &str) -> Result<AccessToken, CredentialError>;

    /// The CBS token type sent alongside tokens from this credential.
    fn token_type(&self) -> &str {
        JWT_TOKEN_TYPE
    }
}
