//! Errors surfaced by the connection scope.

use fe2o3_amqp::connection::OpenError;
use fe2o3_amqp::link::{DetachError, ReceiverAttachError, SenderAttachError};
use fe2o3_amqp::session::BeginError;

use crate::authorization::CredentialError;
use crate::util::DeadlineExceeded;

/// Failure to establish the transport or open the AMQP connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O failure while reaching the service or a proxy.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The WebSocket handshake failed.
    #[error(transparent)]
    WebSocket(#[from] fe2o3_amqp_ws::Error),

    /// SASL negotiation or the AMQP open handshake failed.
    #[error(transparent)]
    Open(#[from] OpenError),

    /// The proxy URL carries no usable host or port.
    #[error("the proxy address is not usable")]
    ProxyAddress,

    /// The proxy rejected the CONNECT handshake.
    #[error("proxy CONNECT failed: {0}")]
    ProxyHandshake(String),

    /// The endpoint could not be recombined into a transport URL.
    #[error(transparent)]
    Endpoint(#[from] url::ParseError),

    /// Beginning the session that carries the CBS link failed.
    #[error("failed to begin the CBS session: {0}")]
    CbsSession(#[source] BeginError),

    /// Attaching the CBS link pair failed.
    #[error("failed to attach the CBS link: {0}")]
    CbsAttach(#[source] fe2o3_amqp_management::error::AttachError),
}

/// Failure to obtain or deliver an authorization token.
#[derive(Debug, thiserror::Error)]
pub enum AuthorizationError {
    /// The credential could not produce a token.
    #[error("the credential failed to produce a token: {0}")]
    Credential(#[source] CredentialError),

    /// The service rejected the put-token exchange.
    #[error(transparent)]
    Cbs(#[from] fe2o3_amqp_management::error::Error),

    /// The token exchange did not finish within its budget.
    #[error("authorization timed out")]
    Timeout,
}

/// Failure to construct one of the scope's links.
#[derive(Debug, thiserror::Error)]
pub enum LinkCreationError {
    /// Beginning the link's session failed.
    #[error(transparent)]
    SessionBegin(#[from] BeginError),

    /// The service refused the sender attach.
    #[error(transparent)]
    SenderAttach(#[from] SenderAttachError),

    /// The service refused the receiver attach.
    #[error(transparent)]
    ReceiverAttach(#[from] ReceiverAttachError),

    /// Attaching the management link pair failed.
    #[error(transparent)]
    ManagementAttach(#[from] fe2o3_amqp_management::error::AttachError),

    /// The link could not be tracked by the scope.
    #[error("could not create link")]
    Registration,
}

/// Errors surfaced by scope operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required input was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The scope has been disposed; no further link may be opened.
    #[error("the connection scope has been disposed")]
    ScopeDisposed,

    /// The caller's cancellation signal fired at a step boundary.
    #[error("the operation was cancelled")]
    Cancelled,

    /// The operation's time budget ran out.
    #[error("the operation timed out")]
    Timeout,

    /// The transport or connection open failed; the next open reconnects.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// CBS authorization failed.
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    /// The link could not be attached or tracked.
    #[error(transparent)]
    LinkCreation(#[from] LinkCreationError),
}

impl From<DeadlineExceeded> for Error {
    fn from(_: DeadlineExceeded) -> Self {
        Error::Timeout
    }
}

/// Failure while gracefully closing a link returned by the scope.
#[derive(Debug, thiserror::Error)]
pub enum CloseError {
    /// Detaching the link failed.
    #[error(transparent)]
    Detach(#[from] DetachError),

    /// Ending the link's session failed.
    #[error(transparent)]
    SessionEnd(#[from] fe2o3_amqp::session::Error),
}
