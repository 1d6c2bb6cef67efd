//! The management link: a request/response pair bound to the service's
//! management node.

use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp_management::client::MgmtClient;
use tokio_util::sync::CancellationToken;

use crate::link::ActiveLinkRegistry;
use crate::scope::error::CloseError;

/// Node address used by the service for management operations.
pub(crate) use fe2o3_amqp_management::MANAGEMENT_NODE_ADDRESS;

/// Reply-to node address for the management client's receiving half.
pub(crate) fn client_node_address(scope_identifier: &str, link_identifier: u64) -> String {
    format!("{scope_identifier}-management-{link_identifier}")
}

/// An open management link obtained from
/// [`AmqpConnectionScope::open_management_link`].
///
/// Management operations carry their authorization per request, so the link
/// is tracked without a refresh timer.
///
/// [`AmqpConnectionScope::open_management_link`]: crate::AmqpConnectionScope::open_management_link
#[derive(Debug)]
pub struct ManagementLink {
    pub(crate) identifier: u64,
    pub(crate) client: MgmtClient,
    pub(crate) session: SessionHandle<()>,
    pub(crate) registry: ActiveLinkRegistry,
    pub(crate) force_close: CancellationToken,
}

impl ManagementLink {
    /// Identifier under which the scope tracks this link.
    pub fn identifier(&self) -> u64 {
        self.identifier
    }

    /// The request/response client bound to the management node.
    pub fn client_mut(&mut self) -> &mut MgmtClient {
        &mut self.client
    }

    /// Whether the scope has force-closed this link because its connection
    /// closed or the scope was disposed.
    pub fn is_force_closed(&self) -> bool {
        self.force_close.is_cancelled()
    }

    /// Detaches the link pair and ends its session.
    pub async fn close(mut self) -> Result<(), CloseError> {
        self.registry.unregister(self.identifier);
        if self.force_close.is_cancelled() {
            // the connection underneath is already gone; detach outcomes are
            // best-effort
            let _ = self.client.close().await;
            let _ = self.session.end().await;
            return Ok(());
        }
        self.client.close().await?;
        self.session.end().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_node_addresses_are_unique_per_link() {
        let first = client_node_address("eh-0a1b2c3d", 4);
        let second = client_node_address("eh-0a1b2c3d", 5);
        assert_eq!(first, "eh-0a1b2c3d-management-4");
        assert_ne!(first, second);
    }
}
