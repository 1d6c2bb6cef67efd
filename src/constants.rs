//! Constants shared across the connection scope.

use std::time::Duration;

/// Name of the SASL handler through which the service advertises the
/// ANONYMOUS mechanism used by connections that authorize over CBS.
pub const CBS_SASL_HANDLER_NAME: &str = "MSSBCBS";

/// Path under which the service accepts AMQP WebSocket connections.
pub const WEBSOCKET_PATH: &str = "/$servicebus/websocket/";

/// Port used for AMQP over TLS when the endpoint does not carry one.
pub(crate) const DEFAULT_AMQPS_PORT: u16 = 5671;

/// Port targeted by the WebSocket transport.
pub(crate) const WSS_PORT: u16 = 443;

/// Idle timeout advertised in the connection open frame.
pub(crate) const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on beginning a single session.
pub(crate) const SESSION_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for one CBS exchange performed by a refresh timer.
pub(crate) const AUTHORIZATION_REFRESH_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Link property holding the caller's remaining operation budget in
/// milliseconds at the time the link was attached.
pub(crate) const TIMEOUT_PROPERTY: &str = "com.microsoft:timeout";

/// Link property identifying the kind of entity the link addresses.
pub(crate) const ENTITY_TYPE_PROPERTY: &str = "com.microsoft:entity-type";

/// Link property carrying the exclusive-consumer epoch.
pub(crate) const OWNER_LEVEL_PROPERTY: &str = "com.microsoft:epoch";

/// Link property carrying a free-form consumer label.
pub(crate) const CONSUMER_IDENTIFIER_PROPERTY: &str = "com.microsoft:receiver-name";

/// Desired capability asking the service to stream last-enqueued-event
/// information on a consumer link.
pub(crate) const TRACK_LAST_ENQUEUED_CAPABILITY: &str =
    "com.microsoft:enable-receiver-runtime-metric";

/// `com.microsoft:entity-type` value for an Event Hub.
pub(crate) const ENTITY_TYPE_EVENT_HUB: i32 = 7;

/// `com.microsoft:entity-type` value for a consumer group.
pub(crate) const ENTITY_TYPE_CONSUMER_GROUP: i32 = 8;
