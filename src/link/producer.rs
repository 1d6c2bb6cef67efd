//! Producer links: sender endpoints publishing into the entity.

use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::Sender;
use fe2o3_amqp_types::definitions::Fields;
use fe2o3_amqp_types::messaging::{Source, Target};
use fe2o3_amqp_types::primitives::{Symbol, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::constants::{ENTITY_TYPE_EVENT_HUB, ENTITY_TYPE_PROPERTY, TIMEOUT_PROPERTY};
use crate::link::ActiveLinkRegistry;
use crate::scope::error::CloseError;

/// Path of the terminus a producer link publishes to: the entity itself, or
/// one of its partitions when a partition id is given.
pub(crate) fn target_path(entity_path: &str, partition_id: Option<&str>) -> String {
    match partition_id {
        Some(partition) if !partition.is_empty() => {
            format!("{entity_path}/Partitions/{partition}")
        }
        _ => entity_path.to_owned(),
    }
}

/// Role-specific pieces of a producer attach.
#[derive(Debug)]
pub(crate) struct ProducerLinkSettings {
    pub(crate) source: Source,
    pub(crate) target: Target,
    pub(crate) properties: Fields,
}

pub(crate) fn link_settings(
    entity_path: &str,
    partition_id: Option<&str>,
    timeout_millis: u32,
) -> ProducerLinkSettings {
    let source = Source::builder()
        .address(Uuid::new_v4().to_string())
        .build();
    let target = Target::builder()
        .address(target_path(entity_path, partition_id))
        .build();

    let mut properties = Fields::new();
    properties.insert(Symbol::from(TIMEOUT_PROPERTY), Value::Uint(timeout_millis));
    properties.insert(
        Symbol::from(ENTITY_TYPE_PROPERTY),
        Value::Int(ENTITY_TYPE_EVENT_HUB),
    );

    ProducerLinkSettings {
        source,
        target,
        properties,
    }
}

/// An open producer link obtained from
/// [`AmqpConnectionScope::open_producer_link`].
///
/// [`AmqpConnectionScope::open_producer_link`]: crate::AmqpConnectionScope::open_producer_link
#[derive(Debug)]
pub struct ProducerLink {
    pub(crate) identifier: u64,
    pub(crate) name: String,
    pub(crate) sender: Sender,
    pub(crate) session: SessionHandle<()>,
    pub(crate) registry: ActiveLinkRegistry,
    pub(crate) force_close: CancellationToken,
}

impl ProducerLink {
    /// Identifier under which the scope tracks this link.
    pub fn identifier(&self) -> u64 {
        self.identifier
    }

    /// Name the link was attached with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sender endpoint.
    pub fn sender_mut(&mut self) -> &mut Sender {
        &mut self.sender
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
            let _ = self.sender.close().await;
            let _ = self.session.end().await;
            return Ok(());
        }
        self.sender.close().await?;
        self.session.end().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_addresses_the_entity_or_one_partition() {
        assert_eq!(target_path("eh", None), "eh");
        assert_eq!(target_path("eh", Some("")), "eh");
        assert_eq!(target_path("eh", Some("0")), "eh/Partitions/0");
    }

    #[test]
    fn settings_carry_the_entity_type_and_timeout_properties() {
        let settings = link_settings("eh", Some("3"), 30_000);

        assert_eq!(
            settings.target.address.as_deref(),
            Some("eh/Partitions/3")
        );
        assert_eq!(
            settings.properties.get(&Symbol::from(TIMEOUT_PROPERTY)),
            Some(&Value::Uint(30_000))
        );
        assert_eq!(
            settings.properties.get(&Symbol::from(ENTITY_TYPE_PROPERTY)),
            Some(&Value::Int(ENTITY_TYPE_EVENT_HUB))
        );
    }

    #[test]
    fn source_addresses_are_unique() {
        let first = link_settings("eh", None, 1_000);
        let second = link_settings("eh", None, 1_000);
        assert_ne!(first.source.address, second.source.address);
    }
}
