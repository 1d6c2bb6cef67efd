//! Builds settings for, and opens, the scope's connections.

use fe2o3_amqp::sasl_profile::SaslProfile;
use fe2o3_amqp::{Connection, Session};
use fe2o3_amqp_cbs::client::CbsClient;
use fe2o3_amqp_types::definitions::Fields;
use fe2o3_amqp_types::primitives::{Symbol, Value};
use fe2o3_amqp_ws::WebSocketStream;
use tracing::debug;
use url::Url;

use crate::constants::{CONNECTION_IDLE_TIMEOUT, WSS_PORT};
use crate::scope::error::{Error, TransportError};
use crate::transport::{self, AmqpTransport, TransportSettings};
use crate::util::Deadline;

use super::OpenedConnection;

/// Opens connections for the scope: resolves transport settings, negotiates
/// SASL ANONYMOUS and the AMQP open handshake within the remaining time
/// budget, then attaches the CBS client so it is available to every link
/// opened on the connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionFactory {
    endpoint: Url,
    transport: AmqpTransport,
    proxy: Option<Url>,
    scope_identifier: String,
}

impl ConnectionFactory {
    pub(crate) fn new(
        endpoint: Url,
        transport: AmqpTransport,
        proxy: Option<Url>,
        scope_identifier: String,
    ) -> Self {
        Self {
            endpoint,
            transport,
            proxy,
            scope_identifier,
        }
    }

    /// Resolved transport settings for this factory's profile.
    pub(crate) fn transport_settings(&self) -> Result<TransportSettings, Error> {
        transport::transport_settings(&self.endpoint, self.transport, self.proxy.as_ref())
    }

    pub(crate) async fn create_and_open(
        &self,
        identifier: u64,
        deadline: Deadline,
    ) -> Result<OpenedConnection, Error> {
        let settings = self.transport_settings()?;
        let host = self
            .endpoint
            .host_str()
            .ok_or(Error::InvalidArgument("the endpoint must carry a host"))?
            .to_owned();

        debug!(connection = identifier, endpoint = %self.endpoint, "opening connection");
        let mut handle = match &settings {
            TransportSettings::Tcp { url } => {
                let open = Connection::builder()
                    .container_id(self.scope_identifier.clone())
                    .idle_time_out(CONNECTION_IDLE_TIMEOUT.as_millis() as u32)
                    .properties(client_properties())
                    .sasl_profile(SaslProfile::Anonymous)
                    .alt_tls_establishment(true)
                    .open(url.as_str());
                tokio::time::timeout(deadline.remaining()?, open)
                    .await
                    .map_err(|_| Error::Timeout)?
                    .map_err(TransportError::Open)?
            }
            TransportSettings::WebSocket { url, proxy } => {
                let stream = match proxy {
                    Some(proxy) => {
                        let tunnel = tokio::time::timeout(
                            deadline.remaining()?,
                            transport::connect_via_proxy(proxy, &host, WSS_PORT),
                        )
                        .await
                        .map_err(|_| Error::Timeout)??;
                        tokio::time::timeout(
                            deadline.remaining()?,
                            WebSocketStream::connect_tls_with_stream(url.as_str(), tunnel),
                        )
                        .await
                        .map_err(|_| Error::Timeout)?
                        .map_err(TransportError::WebSocket)?
                    }
                    None => {
                        tokio::time::timeout(
                            deadline.remaining()?,
                            WebSocketStream::connect(url.as_str()),
                        )
                        .await
                        .map_err(|_| Error::Timeout)?
                        .map_err(TransportError::WebSocket)?
                    }
                };

                let open = Connection::builder()
                    .container_id(self.scope_identifier.clone())
                    .hostname(host.as_str())
                    .idle_time_out(CONNECTION_IDLE_TIMEOUT.as_millis() as u32)
                    .properties(client_properties())
                    .sasl_profile(SaslProfile::Anonymous)
                    .open_with_stream(stream);
                tokio::time::timeout(deadline.remaining()?, open)
                    .await
                    .map_err(|_| Error::Timeout)?
                    .map_err(TransportError::Open)?
            }
        };

        // the CBS link is attached before the connection is handed out, so
        // every authorized link finds it in place
        let mut cbs_session = match tokio::time::timeout(
            deadline.remaining()?,
            Session::begin(&mut handle),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(error)) => {
                let _ = handle.close().await;
                return Err(TransportError::CbsSession(error).into());
            }
            Err(_) => {
                let _ = handle.close().await;
                return Err(Error::Timeout);
            }
        };
        let cbs = match tokio::time::timeout(
            deadline.remaining()?,
            CbsClient::attach(&mut cbs_session),
        )
        .await
        {
            Ok(Ok(cbs)) => cbs,
            Ok(Err(error)) => {
                let _ = cbs_session.end().await;
                let _ = handle.close().await;
                return Err(TransportError::CbsAttach(error).into());
            }
            Err(_) => {
                let _ = cbs_session.end().await;
                let _ = handle.close().await;
                return Err(Error::Timeout);
            }
        };

        debug!(connection = identifier, "connection opened and CBS link attached");
        Ok(OpenedConnection {
            identifier,
            handle,
            cbs_session,
            cbs,
        })
    }
}

/// Client library properties advertised in the connection open frame.
fn client_properties() -> Fields {
    let mut properties = Fields::new();
    properties.insert(
        Symbol::from("product"),
        Value::String(env!("CARGO_PKG_NAME").to_owned()),
    );
    properties.insert(
        Symbol::from("version"),
        Value::String(env!("CARGO_PKG_VERSION").to_owned()),
    );
    properties.insert(Symbol::from("framework"), Value::String("Rust".to_owned()));
    properties.insert(
        Symbol::from("platform"),
        Value::String(format!(
            "{}-{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        )),
    );
    properties
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_properties_identify_the_library() {
        let properties = client_properties();
        assert_eq!(
            properties.get(&Symbol::from("product")),
            Some(&Value::String("eventhubs-amqp".to_owned()))
        );
        assert!(properties.get(&Symbol::from("version")).is_some());
        assert!(properties.get(&Symbol::from("framework")).is_some());
        assert!(properties.get(&Symbol::from("platform")).is_some());
    }

    #[test]
    fn factory_produces_settings_for_its_own_profile_only() {
        let endpoint = Url::parse("sb://ns.example.net/").unwrap();
        let proxy = Url::parse("http://proxy.corp.example:3128/").unwrap();
        let factory = ConnectionFactory::new(
            endpoint,
            AmqpTransport::WebSocket,
            Some(proxy),
            "eh-0a1b2c3d".to_owned(),
        );

        match factory.transport_settings().unwrap() {
            TransportSettings::WebSocket { url, proxy } => {
                assert_eq!(url.as_str(), "wss://ns.example.net/$servicebus/websocket/");
                assert!(proxy.is_some());
            }
            TransportSettings::Tcp { .. } => panic!("TCP settings must not be produced"),
        }
    }
}
