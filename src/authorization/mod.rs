//! Claims-based-security authorization for the scope's links.
//!
//! Every producer and consumer link is authorized by delivering a token to
//! the connection's CBS node before the link attaches, and re-authorized
//! periodically by a per-link refresh timer for as long as the link stays
//! open.

mod credential;
pub(crate) mod refresh;

pub use credential::{AccessToken, CredentialError, TokenCredential, JWT_TOKEN_TYPE, SAS_TOKEN_TYPE};

use std::sync::Arc;
use std::time::Duration;

use fe2o3_amqp_cbs::token::CbsToken;
use fe2o3_amqp_types::primitives::Timestamp;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::connection::SharedConnection;
use crate::scope::error::{AuthorizationError, Error};
use crate::util::Deadline;

/// Claim required to receive events.
pub(crate) const LISTEN_CLAIM: &str = "listen";
/// Claim required to publish events.
pub(crate) const SEND_CLAIM: &str = "send";

pub(crate) const LISTEN_CLAIMS: &[&str] = &[LISTEN_CLAIM];
pub(crate) const SEND_CLAIMS: &[&str] = &[SEND_CLAIM];

/// Audience a token is scoped to: the service host plus the path of the
/// entity the link addresses.
pub(crate) fn audience(endpoint: &Url, path: &str) -> String {
    let host = endpoint.host_str().unwrap_or_default();
    format!("amqp://{}/{}", host, path.trim_start_matches('/'))
}

/// Obtains a token from the credential and delivers it to the connection's
/// CBS node, returning the token's stated expiry.
///
/// The CBS link is attached by the connection factory before any link is
/// opened, so the exchange only needs the shared connection handle. The
/// whole exchange is bounded by `timeout` and aborts when either the
/// caller's or the scope's cancellation fires.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn request_authorization(
    connection: &SharedConnection,
    credential: &Arc<dyn TokenCredential>,
    endpoint: &Url,
    audience: &str,
    claims: &[&str],
    timeout: Duration,
    cancel: &CancellationToken,
    scope_cancel: &CancellationToken,
) -> Result<OffsetDateTime, Error> {
    let deadline = Deadline::after(timeout);
    trace!(%audience, ?claims, "requesting authorization token");

    let token = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        _ = scope_cancel.cancelled() => return Err(Error::ScopeDisposed),
        outcome = tokio::time::timeout(deadline.remaining()?, credential.get_token(endpoint.as_str())) => {
            outcome
                .map_err(|_| AuthorizationError::Timeout)?
                .map_err(AuthorizationError::Credential)?
        }
    };

    let expires_at_utc = token.expires_at_utc;
    let cbs_token = CbsToken::new(
        token.token,
        credential.token_type().to_owned(),
        Timestamp::from((expires_at_utc.unix_timestamp_nanos() / 1_000_000) as i64),
    );

    let mut guard = connection.lock().await;
    match tokio::time::timeout(deadline.remaining()?, guard.put_token(audience, cbs_token)).await {
        Ok(Ok(())) => {
            trace!(%audience, %expires_at_utc, "authorization token accepted");
            Ok(expires_at_utc)
        }
        Ok(Err(error)) => Err(AuthorizationError::Cbs(error).into()),
        Err(_) => Err(AuthorizationError::Timeout.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audience_joins_host_and_entity_path() {
        let endpoint = Url::parse("sb://ns.example.net/").unwrap();
        assert_eq!(audience(&endpoint, "eh"), "amqp://ns.example.net/eh");
        assert_eq!(
            audience(&endpoint, "eh/Partitions/0"),
            "amqp://ns.example.net/eh/Partitions/0"
        );
    }

    #[test]
    fn audience_tolerates_a_leading_slash() {
        let endpoint = Url::parse("sb://ns.example.net/").unwrap();
        assert_eq!(audience(&endpoint, "/eh"), "amqp://ns.example.net/eh");
    }
}
