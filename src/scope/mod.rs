//! The connection scope: one long-lived AMQP connection multiplexing
//! management, producer, and consumer links, with CBS authorization and
//! periodic token refresh for every authorized link.

mod builder;
pub mod error;

pub use builder::Builder;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::{Receiver, Sender};
use fe2o3_amqp_management::client::MgmtClient;
use fe2o3_amqp_types::definitions::SenderSettleMode;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::authorization::refresh::{self, LinkAuthorization, RefreshTimer};
use crate::authorization::{self, TokenCredential};
use crate::connection::factory::ConnectionFactory;
use crate::connection::{RecoverableConnection, SharedConnection};
use crate::constants::SESSION_OPEN_TIMEOUT;
use crate::event_position::EventPosition;
use crate::link::consumer::{self, ConsumerLink, ConsumerOptions};
use crate::link::management::{self, ManagementLink, MANAGEMENT_NODE_ADDRESS};
use crate::link::producer::{self, ProducerLink};
use crate::link::{ActiveLinkRegistry, LinkEntry};
use crate::transport::AmqpTransport;
use crate::util::Deadline;

use error::{Error, LinkCreationError};

/// Owns a single AMQP connection to an Event Hubs style service and hands
/// out management, producer, and consumer links bound to one entity.
///
/// The connection is opened lazily on the first link open and recreated on
/// demand after a fault. Producer and consumer links are authorized over the
/// connection's CBS node before they attach, and re-authorized periodically
/// by a per-link refresh timer for as long as they stay open.
#[derive(Debug)]
pub struct AmqpConnectionScope {
    identifier: String,
    endpoint: Url,
    entity_path: String,
    credential: Arc<dyn TokenCredential>,
    transport: AmqpTransport,
    connection: RecoverableConnection,
    links: ActiveLinkRegistry,
    session_identifiers: AtomicU64,
    link_identifiers: AtomicU64,
    operation_cancellation: CancellationToken,
    disposed: AtomicBool,
}

impl AmqpConnectionScope {
    /// Starts building a scope.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn from_parts(
        endpoint: Url,
        entity_path: String,
        credential: Arc<dyn TokenCredential>,
        transport: AmqpTransport,
        proxy: Option<Url>,
        identifier: String,
    ) -> Self {
        let factory =
            ConnectionFactory::new(endpoint.clone(), transport, proxy, identifier.clone());
        Self {
            identifier,
            endpoint,
            entity_path,
            credential,
            transport,
            connection: RecoverableConnection::new(factory),
            links: ActiveLinkRegistry::new(),
            session_identifiers: AtomicU64::new(0),
            link_identifiers: AtomicU64::new(0),
            operation_cancellation: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Identifier of this scope; doubles as the connection's container-id.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Endpoint of the service the scope is bound to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Name of the entity every link is bound to.
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// Transport profile the scope connects over.
    pub fn transport(&self) -> AmqpTransport {
        self.transport
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_disposed() {
            Err(Error::ScopeDisposed)
        } else {
            Ok(())
        }
    }

    fn check_cancellation(&self, cancel: &CancellationToken) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.operation_cancellation.is_cancelled() {
            return Err(Error::ScopeDisposed);
        }
        Ok(())
    }

    fn link_name(
        &self,
        connection_identifier: u64,
        session_identifier: u64,
        link_identifier: u64,
    ) -> String {
        format!(
            "{};{}:{}:{}",
            self.identifier, connection_identifier, session_identifier, link_identifier
        )
    }

    /// Begins a fresh single-link session, bounded by the session-open
    /// timeout and by the caller's remaining budget.
    async fn begin_session(
        &self,
        connection: &SharedConnection,
        deadline: Deadline,
    ) -> Result<(SessionHandle<()>, u64, u64), Error> {
        let session_identifier = self.session_identifiers.fetch_add(1, Ordering::Relaxed);
        let mut guard = connection.lock().await;
        let connection_identifier = guard.identifier();
        let budget = deadline.remaining()?.min(SESSION_OPEN_TIMEOUT);
        let session = tokio::time::timeout(budget, guard.begin_session())
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(LinkCreationError::SessionBegin)?;
        Ok((session, connection_identifier, session_identifier))
    }

    /// Tracks an authorized link and arms its refresh timer. The timer is
    /// created disarmed, registered together with the link, and only then
    /// does the refresh task start.
    fn track_authorized_link(
        &self,
        link_identifier: u64,
        connection: &SharedConnection,
        audience: &str,
        claims: &'static [&'static str],
        expires_at_utc: OffsetDateTime,
    ) -> Result<CancellationToken, Error> {
        let force_close = CancellationToken::new();
        let timer_cancel = CancellationToken::new();
        let entry = LinkEntry::with_refresh(
            RefreshTimer::disarmed(timer_cancel.clone()),
            force_close.clone(),
        );
        self.links.register(link_identifier, entry)?;

        let link_authorization = Arc::new(LinkAuthorization {
            connection: Arc::clone(connection),
            credential: Arc::clone(&self.credential),
            endpoint: self.endpoint.clone(),
            audience: audience.to_owned(),
            claims,
            scope_cancel: self.operation_cancellation.clone(),
        });
        let initial = refresh::calculate_refresh_interval(expires_at_utc, OffsetDateTime::now_utc());
        let task = refresh::spawn_refresh(link_authorization, link_identifier, initial, timer_cancel);
        self.links.arm_refresh(link_identifier, task);
        Ok(force_close)
    }

    /// Opens the management link: a request/response pair against the
    /// service's management node. Management requests carry their own
    /// authorization, so no refresh timer is armed.
    pub async fn open_management_link(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ManagementLink, Error> {
        self.ensure_open()?;
        self.check_cancellation(cancel)?;
        let deadline = Deadline::after(timeout);

        let connection = self.connection.get_or_create(&self.links, deadline).await?;
        self.check_cancellation(cancel)?;

        let (mut session, _, _) = self.begin_session(&connection, deadline).await?;
        if let Err(error) = self.check_cancellation(cancel) {
            let _ = session.end().await;
            return Err(error);
        }

        let link_identifier = self.link_identifiers.fetch_add(1, Ordering::Relaxed);
        let remaining = match deadline.remaining() {
            Ok(remaining) => remaining,
            Err(_) => {
                let _ = session.end().await;
                return Err(Error::Timeout);
            }
        };
        let attach = MgmtClient::builder()
            .management_node_address(MANAGEMENT_NODE_ADDRESS)
            .client_node_addr(management::client_node_address(
                &self.identifier,
                link_identifier,
            ))
            .attach(&mut session);
        let client = match tokio::time::timeout(remaining, attach).await {
            Ok(Ok(client)) => client,
            Ok(Err(error)) => {
                let _ = session.end().await;
                return Err(LinkCreationError::ManagementAttach(error).into());
            }
            Err(_) => {
                let _ = session.end().await;
                return Err(Error::Timeout);
            }
        };

        let force_close = CancellationToken::new();
        if let Err(error) = self
            .links
            .register(link_identifier, LinkEntry::new(force_close.clone()))
        {
            let _ = client.close().await;
            let _ = session.end().await;
            return Err(error);
        }
        debug!(scope = %self.identifier, link = link_identifier, "management link opened");

        Ok(ManagementLink {
            identifier: link_identifier,
            client,
            session,
            registry: self.links.clone(),
            force_close,
        })
    }

    /// Opens a producer link publishing to the entity, or to a single
    /// partition when `partition_id` is given.
    pub async fn open_producer_link(
        &self,
        partition_id: Option<&str>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProducerLink, Error> {
        self.ensure_open()?;
        self.check_cancellation(cancel)?;
        let deadline = Deadline::after(timeout);

        let connection = self.connection.get_or_create(&self.links, deadline).await?;
        self.check_cancellation(cancel)?;

        let target_path = producer::target_path(&self.entity_path, partition_id);
        let audience = authorization::audience(&self.endpoint, &target_path);
        let expires_at_utc = authorization::request_authorization(
            &connection,
            &self.credential,
            &self.endpoint,
            &audience,
            authorization::SEND_CLAIMS,
            deadline.remaining()?,
            cancel,
            &self.operation_cancellation,
        )
        .await?;
        self.check_cancellation(cancel)?;

        let (mut session, connection_identifier, session_identifier) =
            self.begin_session(&connection, deadline).await?;
        if let Err(error) = self.check_cancellation(cancel) {
            let _ = session.end().await;
            return Err(error);
        }

        let link_identifier = self.link_identifiers.fetch_add(1, Ordering::Relaxed);
        let link_name = self.link_name(connection_identifier, session_identifier, link_identifier);
        let remaining = match deadline.remaining() {
            Ok(remaining) => remaining,
            Err(_) => {
                let _ = session.end().await;
                return Err(Error::Timeout);
            }
        };

        let settings = producer::link_settings(
            &self.entity_path,
            partition_id,
            remaining.as_millis().min(u32::MAX as u128) as u32,
        );
        let attach = Sender::builder()
            .name(link_name.clone())
            .source(settings.source)
            .target(settings.target)
            .sender_settle_mode(SenderSettleMode::Settled)
            .properties(settings.properties)
            .attach(&mut session);
        let sender = match tokio::time::timeout(remaining, attach).await {
            Ok(Ok(sender)) => sender,
            Ok(Err(error)) => {
                let _ = session.end().await;
                return Err(LinkCreationError::SenderAttach(error).into());
            }
            Err(_) => {
                let _ = session.end().await;
                return Err(Error::Timeout);
            }
        };

        match self.track_authorized_link(
            link_identifier,
            &connection,
            &audience,
            authorization::SEND_CLAIMS,
            expires_at_utc,
        ) {
            Ok(force_close) => {
                debug!(
                    scope = %self.identifier,
                    link = link_identifier,
                    name = %link_name,
                    "producer link opened"
                );
                Ok(ProducerLink {
                    identifier: link_identifier,
                    name: link_name,
                    sender,
                    session,
                    registry: self.links.clone(),
                    force_close,
                })
            }
            Err(error) => {
                let _ = sender.close().await;
                let _ = session.end().await;
                Err(error)
            }
        }
    }

    /// Opens a consumer link reading one partition of a consumer group,
    /// starting from `event_position`.
    pub async fn open_consumer_link(
        &self,
        consumer_group: &str,
        partition_id: &str,
        event_position: EventPosition,
        options: ConsumerOptions,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ConsumerLink, Error> {
        self.ensure_open()?;
        self.check_cancellation(cancel)?;
        if consumer_group.is_empty() {
            return Err(Error::InvalidArgument("a consumer group is required"));
        }
        if partition_id.is_empty() {
            return Err(Error::InvalidArgument("a partition id is required"));
        }
        let deadline = Deadline::after(timeout);

        let connection = self.connection.get_or_create(&self.links, deadline).await?;
        self.check_cancellation(cancel)?;

        let source_path = consumer::source_path(&self.entity_path, consumer_group, partition_id);
        let audience = authorization::audience(&self.endpoint, &source_path);
        let expires_at_utc = authorization::request_authorization(
            &connection,
            &self.credential,
            &self.endpoint,
            &audience,
            authorization::LISTEN_CLAIMS,
            deadline.remaining()?,
            cancel,
            &self.operation_cancellation,
        )
        .await?;
        self.check_cancellation(cancel)?;

        let (mut session, connection_identifier, session_identifier) =
            self.begin_session(&connection, deadline).await?;
        if let Err(error) = self.check_cancellation(cancel) {
            let _ = session.end().await;
            return Err(error);
        }

        let link_identifier = self.link_identifiers.fetch_add(1, Ordering::Relaxed);
        let link_name = self.link_name(connection_identifier, session_identifier, link_identifier);
        let remaining = match deadline.remaining() {
            Ok(remaining) => remaining,
            Err(_) => {
                let _ = session.end().await;
                return Err(Error::Timeout);
            }
        };

        let settings = consumer::link_settings(
            &self.entity_path,
            consumer_group,
            partition_id,
            &event_position,
            &options,
        );
        let builder = Receiver::builder()
            .name(link_name.clone())
            .source(settings.source)
            .target(settings.target)
            .sender_settle_mode(SenderSettleMode::Settled)
            .credit_mode(settings.credit_mode)
            .properties(settings.properties);
        let builder = if settings.desired_capabilities.is_empty() {
            builder
        } else {
            builder.set_desired_capabilities(settings.desired_capabilities)
        };
        let receiver = match tokio::time::timeout(remaining, builder.attach(&mut session)).await {
            Ok(Ok(receiver)) => receiver,
            Ok(Err(error)) => {
                let _ = session.end().await;
                return Err(LinkCreationError::ReceiverAttach(error).into());
            }
            Err(_) => {
                let _ = session.end().await;
                return Err(Error::Timeout);
            }
        };

        match self.track_authorized_link(
            link_identifier,
            &connection,
            &audience,
            authorization::LISTEN_CLAIMS,
            expires_at_utc,
        ) {
            Ok(force_close) => {
                debug!(
                    scope = %self.identifier,
                    link = link_identifier,
                    name = %link_name,
                    "consumer link opened"
                );
                Ok(ConsumerLink {
                    identifier: link_identifier,
                    name: link_name,
                    receiver,
                    session,
                    registry: self.links.clone(),
                    force_close,
                })
            }
            Err(error) => {
                let _ = receiver.close().await;
                let _ = session.end().await;
                Err(error)
            }
        }
    }

    /// Closes the connection (force-closing every tracked link), cancels
    /// in-flight authorization requests, and marks the scope disposed.
    /// Opening further links fails with [`Error::ScopeDisposed`]; calling
    /// this again is a no-op.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(scope = %self.identifier, "disposing connection scope");
        self.connection.dispose(&self.links).await;
        self.operation_cancellation.cancel();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::authorization::{AccessToken, CredentialError};

    use super::*;

    #[derive(Debug)]
    struct StaticCredential;

    #[async_trait]
    impl TokenCredential for StaticCredential {
        async fn get_token(&self, _resource: &str) -> Result<AccessToken, CredentialError> {
            Ok(AccessToken {
                token: "token".to_owned(),
                expires_at_utc: OffsetDateTime::now_utc() + time::Duration::hours(1),
            })
        }
    }

    fn scope() -> AmqpConnectionScope {
        AmqpConnectionScope::builder()
            .endpoint(Url::parse("sb://ns.example.net/").unwrap())
            .entity_path("eh")
            .credential(Arc::new(StaticCredential))
            .build()
            .unwrap()
    }

    #[test]
    fn generated_identifiers_suffix_the_entity_with_eight_hex_digits() {
        let scope = scope();
        let identifier = scope.identifier();
        let suffix = identifier.strip_prefix("eh-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn explicit_identifiers_are_kept() {
        let scope = AmqpConnectionScope::builder()
            .endpoint(Url::parse("sb://ns.example.net/").unwrap())
            .entity_path("eh")
            .credential(Arc::new(StaticCredential))
            .identifier("fixed-id")
            .build()
            .unwrap();
        assert_eq!(scope.identifier(), "fixed-id");
    }

    #[test]
    fn construction_requires_entity_endpoint_and_credential() {
        let missing_entity = AmqpConnectionScope::builder()
            .endpoint(Url::parse("sb://ns.example.net/").unwrap())
            .credential(Arc::new(StaticCredential))
            .build();
        assert!(matches!(missing_entity, Err(Error::InvalidArgument(_))));

        let empty_entity = AmqpConnectionScope::builder()
            .endpoint(Url::parse("sb://ns.example.net/").unwrap())
            .entity_path("")
            .credential(Arc::new(StaticCredential))
            .build();
        assert!(matches!(empty_entity, Err(Error::InvalidArgument(_))));

        let missing_credential = AmqpConnectionScope::builder()
            .endpoint(Url::parse("sb://ns.example.net/").unwrap())
            .entity_path("eh")
            .build();
        assert!(matches!(missing_credential, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn link_names_chain_scope_connection_session_and_link() {
        let scope = AmqpConnectionScope::builder()
            .endpoint(Url::parse("sb://ns.example.net/").unwrap())
            .entity_path("eh")
            .credential(Arc::new(StaticCredential))
            .identifier("eh-0a1b2c3d")
            .build()
            .unwrap();
        assert_eq!(scope.link_name(0, 1, 2), "eh-0a1b2c3d;0:1:2");
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_observable() {
        let scope = scope();
        assert!(!scope.is_disposed());

        scope.dispose().await;
        assert!(scope.is_disposed());

        // second dispose is a no-op
        scope.dispose().await;
        assert!(scope.is_disposed());
    }

    #[tokio::test]
    async fn links_cannot_be_opened_after_dispose() {
        let scope = scope();
        scope.dispose().await;

        let cancel = CancellationToken::new();
        let outcome = scope
            .open_management_link(Duration::from_secs(5), &cancel)
            .await;
        assert!(matches!(outcome, Err(Error::ScopeDisposed)));
    }

    #[tokio::test]
    async fn a_cancelled_caller_is_noticed_before_any_work() {
        let scope = scope();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = scope
            .open_producer_link(None, Duration::from_secs(5), &cancel)
            .await;
        assert!(matches!(outcome, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn an_exhausted_budget_fails_fast_without_connecting() {
        let scope = scope();
        let cancel = CancellationToken::new();

        let outcome = scope.open_management_link(Duration::ZERO, &cancel).await;
        assert!(matches!(outcome, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn empty_consumer_inputs_are_rejected() {
        let scope = scope();
        let cancel = CancellationToken::new();

        let outcome = scope
            .open_consumer_link(
                "",
                "0",
                EventPosition::earliest(),
                ConsumerOptions::default(),
                Duration::from_secs(5),
                &cancel,
            )
            .await;
        assert!(matches!(outcome, Err(Error::InvalidArgument(_))));
    }
}
