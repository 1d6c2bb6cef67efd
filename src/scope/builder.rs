use std::sync::Arc;

use url::Url;

use crate::authorization::TokenCredential;
use crate::scope::error::Error;
use crate::scope::AmqpConnectionScope;
use crate::transport::AmqpTransport;

/// Builder for [`AmqpConnectionScope`].
#[derive(Debug, Default)]
pub struct Builder {
    endpoint: Option<Url>,
    entity_path: Option<String>,
    credential: Option<Arc<dyn TokenCredential>>,
    transport: AmqpTransport,
    proxy: Option<Url>,
    identifier: Option<String>,
}

impl Builder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Service endpoint, e.g. `sb://namespace.example.net/`.
    pub fn endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Name of the entity every link opened through the scope is bound to.
    pub fn entity_path(mut self, entity_path: impl Into<String>) -> Self {
        self.entity_path = Some(entity_path.into());
        self
    }

    /// Credential used to authorize links over CBS.
    pub fn credential(mut self, credential: Arc<dyn TokenCredential>) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Transport profile; TCP with TLS unless WebSockets is selected.
    pub fn transport(mut self, transport: AmqpTransport) -> Self {
        self.transport = transport;
        self
    }

    /// HTTP proxy for the WebSocket transport. Not consulted over TCP.
    pub fn proxy(mut self, proxy: Url) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Overrides the generated scope identifier.
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Validates the inputs and assembles the scope.
    pub fn build(self) -> Result<AmqpConnectionScope, Error> {
        let endpoint = self
            .endpoint
            .ok_or(Error::InvalidArgument("an endpoint is required"))?;
        if endpoint.host_str().map_or(true, str::is_empty) {
            return Err(Error::InvalidArgument("the endpoint must carry a host"));
        }
        let entity_path = self
            .entity_path
            .filter(|path| !path.is_empty())
            .ok_or(Error::InvalidArgument("an entity path is required"))?;
        let credential = self
            .credential
            .ok_or(Error::InvalidArgument("a credential is required"))?;
        let identifier = self
            .identifier
            .filter(|identifier| !identifier.is_empty())
            .unwrap_or_else(|| format!("{}-{:08x}", entity_path, rand::random::<u32>()));

        Ok(AmqpConnectionScope::from_parts(
            endpoint,
            entity_path,
            credential,
            self.transport,
            self.proxy,
            identifier,
        ))
    }
}
