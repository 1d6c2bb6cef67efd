//! Consumer links: receiver endpoints bound to one partition of a consumer
//! group.

use fe2o3_amqp::link::receiver::CreditMode;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::Receiver;
use fe2o3_amqp_ext::filters::SelectorFilter;
use fe2o3_amqp_types::definitions::Fields;
use fe2o3_amqp_types::messaging::{Source, Target};
use fe2o3_amqp_types::primitives::{Symbol, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::constants::{
    CONSUMER_IDENTIFIER_PROPERTY, ENTITY_TYPE_CONSUMER_GROUP, ENTITY_TYPE_PROPERTY,
    OWNER_LEVEL_PROPERTY, TRACK_LAST_ENQUEUED_CAPABILITY,
};
use crate::event_position::EventPosition;
use crate::link::ActiveLinkRegistry;
use crate::scope::error::CloseError;

/// Filter-set key under which the consumer's selector filter is attached.
pub(crate) const CONSUMER_FILTER_KEY: &str = "apache.org:selector-filter:string";

/// Options shaping a consumer link attach.
#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    /// Credits issued to the link up front. Automatic credit flow is enabled
    /// exactly when this is non-zero.
    pub prefetch_count: u32,
    /// Epoch making the link an exclusive consumer of its partition,
    /// displacing consumers with a lower epoch.
    pub owner_level: Option<i64>,
    /// Asks the service to stream information about the last event enqueued
    /// to the partition.
    pub track_last_enqueued_event_information: bool,
    /// Free-form label identifying this consumer to the service.
    pub identifier: Option<String>,
}

/// Source path for a consumer bound to one partition of a consumer group.
pub(crate) fn source_path(entity_path: &str, consumer_group: &str, partition_id: &str) -> String {
    format!("{entity_path}/ConsumerGroups/{consumer_group}/Partitions/{partition_id}")
}

/// Role-specific pieces of a consumer attach.
#[derive(Debug)]
pub(crate) struct ConsumerLinkSettings {
    pub(crate) source: Source,
    pub(crate) target: Target,
    pub(crate) properties: Fields,
    pub(crate) desired_capabilities: Vec<Symbol>,
    pub(crate) credit_mode: CreditMode,
}

pub(crate) fn link_settings(
    entity_path: &str,
    consumer_group: &str,
    partition_id: &str,
    event_position: &EventPosition,
    options: &ConsumerOptions,
) -> ConsumerLinkSettings {
    let source = Source::builder()
        .address(source_path(entity_path, consumer_group, partition_id))
        .add_to_filter(
            CONSUMER_FILTER_KEY,
            SelectorFilter::new(event_position.filter_expression()),
        )
        .build();
    let target = Target::builder()
        .address(Uuid::new_v4().to_string())
        .build();

    let mut properties = Fields::new();
    properties.insert(
        Symbol::from(ENTITY_TYPE_PROPERTY),
        Value::Int(ENTITY_TYPE_CONSUMER_GROUP),
    );
    if let Some(owner_level) = options.owner_level {
        properties.insert(Symbol::from(OWNER_LEVEL_PROPERTY), Value::Long(owner_level));
    }
    if let Some(identifier) = options.identifier.as_deref().filter(|id| !id.is_empty()) {
        properties.insert(
            Symbol::from(CONSUMER_IDENTIFIER_PROPERTY),
            Value::String(identifier.to_owned()),
        );
    }

    let mut desired_capabilities = Vec::new();
    if options.track_last_enqueued_event_information {
        desired_capabilities.push(Symbol::from(TRACK_LAST_ENQUEUED_CAPABILITY));
    }

    let credit_mode = match options.prefetch_count {
        0 => CreditMode::Manual,
        credit => CreditMode::Auto(credit),
    };

    ConsumerLinkSettings {
        source,
        target,
        properties,
        desired_capabilities,
        credit_mode,
    }
}

/// An open consumer link obtained from
/// [`AmqpConnectionScope::open_consumer_link`].
///
/// [`AmqpConnectionScope::open_consumer_link`]: crate::AmqpConnectionScope::open_consumer_link
#[derive(Debug)]
pub struct ConsumerLink {
    pub(crate) identifier: u64,
    pub(crate) name: String,
    pub(crate) receiver: Receiver,
    pub(crate) session: SessionHandle<()>,
    pub(crate) registry: ActiveLinkRegistry,
    pub(crate) force_close: CancellationToken,
}

impl ConsumerLink {
    /// Identifier under which the scope tracks this link.
    pub fn identifier(&self) -> u64 {
        self.identifier
    }

    /// Name the link was attached with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The receiver endpoint.
    pub fn receiver_mut(&mut self) -> &mut Receiver {
        &mut self.receiver
    }

    /// Whether the scope has force-closed this link because its connection
    /// closed or the scope was disposed.
    pub fn is_force_closed(&self) -> bool {
        self.force_close.is_cancelled()
    }

    /// Detaches the link and ends its session. The link's refresh timer is
    /// stopped before the link stops being tracked.
    pub async fn close(mut self) -> Result<(), CloseError> {
        self.registry.unregister(self.identifier);
        if self.force_close.is_cancelled() {
            let _ = self.receiver.close().await;
            let _ = self.session.end().await;
            return Ok(());
        }
        self.receiver.close().await?;
        self.session.end().await?;
        Ok(())
    }
}
