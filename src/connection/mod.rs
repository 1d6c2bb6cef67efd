//! The scope's fault-tolerant connection singleton.

pub(crate) mod factory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::session::{BeginError, SessionHandle};
use fe2o3_amqp::Session;
use fe2o3_amqp_cbs::client::CbsClient;
use fe2o3_amqp_cbs::token::CbsToken;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::link::ActiveLinkRegistry;
use crate::scope::error::Error;
use crate::util::Deadline;

use factory::ConnectionFactory;

/// A connection that has completed SASL and AMQP negotiation and carries an
/// attached CBS client.
#[derive(Debug)]
pub(crate) struct OpenedConnection {
    identifier: u64,
    handle: ConnectionHandle<()>,
    cbs_session: SessionHandle<()>,
    cbs: CbsClient,
}

pub(crate) type SharedConnection = Arc<Mutex<OpenedConnection>>;

impl OpenedConnection {
    pub(crate) fn identifier(&self) -> u64 {
        self.identifier
    }

    pub(crate) async fn begin_session(&mut self) -> Result<SessionHandle<()>, BeginError> {
        Session::begin(&mut self.handle).await
    }

    pub(crate) async fn put_token(
        &mut self,
        name: &str,
        token: CbsToken<'_>,
    ) -> Result<(), fe2o3_amqp_management::error::Error> {
        self.cbs.put_token(name, token).await
    }

    fn is_faulted(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close_handle(&mut self) -> Result<(), fe2o3_amqp::connection::Error> {
        self.handle.close().await
    }

    /// Graceful teardown: detach the CBS pair, end its session, close the
    /// connection. Errors are expected when the remote end is already gone.
    async fn shut_down(mut self) {
        let identifier = self.identifier;
        if let Err(error) = self.cbs.close().await {
            debug!(connection = identifier, %error, "detaching the CBS link reported an error");
        }
        if let Err(error) = self.cbs_session.end().await {
            debug!(connection = identifier, %error, "ending the CBS session reported an error");
        }
        if let Err(error) = self.handle.close().await {
            debug!(connection = identifier, %error, "closing the connection reported an error");
        }
    }
}

/// State of the connection slot. The in-flight open is not a state of its
/// own: whoever holds the slot lock is the opener, and every concurrent
/// caller queues behind that same open.
#[derive(Debug)]
enum ConnectionSlot {
    Empty,
    Ready(SharedConnection),
    Disposed,
}

/// Holds at most one open connection, lazily (re)created on demand.
///
/// A held connection observed closed or aborted falls back to `Empty` after
/// its tracked links are force-closed, and the next caller reopens. Disposal
/// is terminal.
#[derive(Debug)]
pub(crate) struct RecoverableConnection {
    factory: ConnectionFactory,
    slot: Mutex<ConnectionSlot>,
    identifiers: AtomicU64,
}

impl RecoverableConnection {
    pub(crate) fn new(factory: ConnectionFactory) -> Self {
        Self {
            factory,
            slot: Mutex::new(ConnectionSlot::Empty),
            identifiers: AtomicU64::new(0),
        }
    }

    /// Returns the held connection, opening a new one when the slot is empty
    /// or the held connection has faulted. A failed open leaves the slot
    /// empty and is reported to every caller queued on it.
    pub(crate) async fn get_or_create(
        &self,
        registry: &ActiveLinkRegistry,
        deadline: Deadline,
    ) -> Result<SharedConnection, Error> {
        let mut slot = self.slot.lock().await;
        match &*slot {
            ConnectionSlot::Disposed => return Err(Error::ScopeDisposed),
            ConnectionSlot::Ready(connection) => {
                let faulted = connection.lock().await.is_faulted();
                if !faulted {
                    return Ok(Arc::clone(connection));
                }
                warn!("connection faulted, force-closing its tracked links before reopening");
                if let ConnectionSlot::Ready(connection) =
                    std::mem::replace(&mut *slot, ConnectionSlot::Empty)
                {
                    close_expired(connection, registry).await;
                }
            }
            ConnectionSlot::Empty => {}
        }

        let identifier = self.identifiers.fetch_add(1, Ordering::Relaxed);
        let opened = self.factory.create_and_open(identifier, deadline).await?;
        let connection: SharedConnection = Arc::new(Mutex::new(opened));
        *slot = ConnectionSlot::Ready(Arc::clone(&connection));
        Ok(connection)
    }

    /// Closes the held connection after force-closing every tracked link and
    /// rejects any further `get_or_create`. Calling this again is a no-op.
    pub(crate) async fn dispose(&self, registry: &ActiveLinkRegistry) {
        let mut slot = self.slot.lock().await;
        if let ConnectionSlot::Ready(connection) =
            std::mem::replace(&mut *slot, ConnectionSlot::Disposed)
        {
            close_expired(connection, registry).await;
        }
    }
}

/// One-shot close chain for a connection leaving service: every tracked link
/// is force-closed first, then the AMQP objects are torn down.
async fn close_expired(connection: SharedConnection, registry: &ActiveLinkRegistry) {
    registry.close_all();
    match Arc::try_unwrap(connection) {
        Ok(exclusive) => exclusive.into_inner().shut_down().await,
        Err(shared) => {
            // an opener or refresh task still holds the connection; closing
            // through the handle tears the engine down regardless of who
            // drops the reference last
            let mut guard = shared.lock().await;
            if let Err(error) = guard.close_handle().await {
                debug!(%error, "closing the connection reported an error");
            }
        }
    }
}
