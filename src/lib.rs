#![deny(missing_docs, missing_debug_implementations)]

//! AMQP 1.0 connection scope for Event Hubs style messaging services, built
//! on top of [`fe2o3_amqp`].
//!
//! A scope owns one long-lived connection to a service endpoint and
//! multiplexes management, producer, and consumer links over it. The
//! connection is opened lazily with an ANONYMOUS SASL profile and recreated
//! on demand after a fault; producer and consumer links are authorized
//! through the connection's CBS node before they attach, and a per-link
//! timer keeps re-delivering tokens for as long as the link stays open.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use eventhubs_amqp::{AmqpConnectionScope, AmqpTransport, ConsumerOptions, EventPosition};
//! # use eventhubs_amqp::{AccessToken, CredentialError, TokenCredential};
//! # #[derive(Debug)]
//! # struct DevCredential;
//! # #[async_trait::async_trait]
//! # impl TokenCredential for DevCredential {
//! #     async fn get_token(&self, _resource: &str) -> Result<AccessToken, CredentialError> {
//! #         unimplemented!()
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scope = AmqpConnectionScope::builder()
//!         .endpoint("sb://namespace.example.net/".parse()?)
//!         .entity_path("telemetry")
//!         .credential(Arc::new(DevCredential))
//!         .transport(AmqpTransport::Tcp)
//!         .build()?;
//!
//!     let cancel = tokio_util::sync::CancellationToken::new();
//!     let consumer = scope
//!         .open_consumer_link(
//!             "$Default",
//!             "0",
//!             EventPosition::latest(),
//!             ConsumerOptions {
//!                 prefetch_count: 300,
//!                 ..Default::default()
//!             },
//!             Duration::from_secs(30),
//!             &cancel,
//!         )
//!         .await?;
//!
//!     // receive through `consumer.receiver_mut()`, then:
//!     consumer.close().await?;
//!     scope.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod authorization;
pub mod constants;
pub mod event_position;
pub mod link;
pub mod scope;
pub mod transport;

mod connection;
mod util;

pub use authorization::{AccessToken, CredentialError, TokenCredential};
pub use event_position::EventPosition;
pub use link::consumer::{ConsumerLink, ConsumerOptions};
pub use link::management::ManagementLink;
pub use link::producer::ProducerLink;
pub use scope::error::{CloseError, Error};
pub use scope::AmqpConnectionScope;
pub use transport::AmqpTransport;
