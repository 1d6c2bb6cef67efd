//! Transport profiles over which the scope's connection is established.

use std::str::FromStr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::constants::{DEFAULT_AMQPS_PORT, WEBSOCKET_PATH};
use crate::scope::error::{Error, TransportError};

/// Transport profile for the AMQP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmqpTransport {
    /// AMQP over TCP with TLS, on port 5671 unless the endpoint carries one.
    #[default]
    Tcp,
    /// AMQP bound to WebSockets (`wss`), optionally through an HTTP proxy.
    WebSocket,
}

impl AmqpTransport {
    /// Whether this profile tunnels AMQP frames through a WebSocket.
    pub fn uses_websockets(&self) -> bool {
        matches!(self, Self::WebSocket)
    }
}

impl FromStr for AmqpTransport {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" | "amqp" | "amqp-tcp" => Ok(Self::Tcp),
            "ws" | "websocket" | "websockets" | "amqp-websockets" => Ok(Self::WebSocket),
            _ => Err(Error::InvalidArgument(
                "transport must be one of tcp or websockets",
            )),
        }
    }
}

/// Fully resolved transport settings for a connection open attempt. Exactly
/// one profile's settings are produced per attempt.
#[derive(Debug, Clone)]
pub(crate) enum TransportSettings {
    Tcp { url: Url },
    WebSocket { url: Url, proxy: Option<Url> },
}

pub(crate) fn transport_settings(
    endpoint: &Url,
    transport: AmqpTransport,
    proxy: Option<&Url>,
) -> Result<TransportSettings, Error> {
    let host = endpoint
        .host_str()
        .ok_or(Error::InvalidArgument("the endpoint must carry a host"))?;

    match transport {
        AmqpTransport::Tcp => {
            let port = endpoint.port().unwrap_or(DEFAULT_AMQPS_PORT);
            let url = Url::parse(&format!("amqps://{host}:{port}"))
                .map_err(TransportError::Endpoint)?;
            Ok(TransportSettings::Tcp { url })
        }
        AmqpTransport::WebSocket => {
            let url = Url::parse(&format!("wss://{host}{WEBSOCKET_PATH}"))
                .map_err(TransportError::Endpoint)?;
            Ok(TransportSettings::WebSocket {
                url,
                proxy: proxy.cloned(),
            })
        }
    }
}

/// Establishes a tunnel to `target_host:target_port` through an HTTP proxy
/// with a CONNECT handshake. Negotiation beyond the status check is left to
/// the proxy.
pub(crate) async fn connect_via_proxy(
    proxy: &Url,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream, TransportError> {
    let proxy_host = proxy.host_str().ok_or(TransportError::ProxyAddress)?;
    let proxy_port = proxy
        .port_or_known_default()
        .ok_or(TransportError::ProxyAddress)?;

    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;
    let request = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response: Vec<u8> = Vec::with_capacity(256);
    let mut buf = [0u8; 256];
    while !response.windows(4).any(|window| window == b"\r\n\r\n") {
        if response.len() > 8 * 1024 {
            return Err(TransportError::ProxyHandshake(
                "oversized CONNECT response".to_string(),
            ));
        }
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            return Err(TransportError::ProxyHandshake(
                "proxy closed the connection during CONNECT".to_string(),
            ));
        }
        response.extend_from_slice(&buf[..read]);
    }

    let status_line = response
        .split(|byte| *byte == b'\r')
        .next()
        .map(String::from_utf8_lossy)
        .unwrap_or_default()
        .into_owned();
    match status_line.split_whitespace().nth(1) {
        Some("200") => Ok(stream),
        _ => Err(TransportError::ProxyHandshake(format!(
            "proxy refused CONNECT: {status_line}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Url {
        Url::parse("sb://ns.example.net/").unwrap()
    }

    #[test]
    fn tcp_settings_default_to_the_amqps_port() {
        let settings = transport_settings(&endpoint(), AmqpTransport::Tcp, None).unwrap();
        match settings {
            TransportSettings::Tcp { url } => {
                assert_eq!(url.as_str(), "amqps://ns.example.net:5671")
            }
            other => panic!("expected TCP settings, got {other:?}"),
        }
    }

    #[test]
    fn tcp_settings_keep_an_explicit_port() {
        let endpoint = Url::parse("sb://ns.example.net:5672/").unwrap();
        let settings = transport_settings(&endpoint, AmqpTransport::Tcp, None).unwrap();
        match settings {
            TransportSettings::Tcp { url } => assert_eq!(url.port(), Some(5672)),
            other => panic!("expected TCP settings, got {other:?}"),
        }
    }

    #[test]
    fn websocket_settings_address_the_websocket_path_and_carry_the_proxy() {
        let proxy = Url::parse("http://proxy.corp.example:3128/").unwrap();
        let settings =
            transport_settings(&endpoint(), AmqpTransport::WebSocket, Some(&proxy)).unwrap();
        match settings {
            TransportSettings::WebSocket { url, proxy } => {
                assert_eq!(url.as_str(), "wss://ns.example.net/$servicebus/websocket/");
                assert_eq!(proxy.unwrap().host_str(), Some("proxy.corp.example"));
            }
            other => panic!("expected WebSocket settings, got {other:?}"),
        }
    }

    #[test]
    fn unknown_transport_names_are_rejected() {
        assert!(matches!(
            "carrier-pigeon".parse::<AmqpTransport>(),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!("tcp".parse::<AmqpTransport>().unwrap(), AmqpTransport::Tcp);
        assert_eq!(
            "WebSockets".parse::<AmqpTransport>().unwrap(),
            AmqpTransport::WebSocket
        );
    }
}
