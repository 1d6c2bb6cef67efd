//! Tracking of live links and coordination of their closure.

pub mod consumer;
pub mod management;
pub mod producer;

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::authorization::refresh::RefreshTimer;
use crate::scope::error::{Error, LinkCreationError};

/// A tracked link: its refresh timer (absent for management links) and the
/// one-shot signal fired when the scope force-closes the link.
#[derive(Debug)]
pub(crate) struct LinkEntry {
    refresh: Option<RefreshTimer>,
    close_signal: CancellationToken,
}

impl LinkEntry {
    pub(crate) fn new(close_signal: CancellationToken) -> Self {
        Self {
            refresh: None,
            close_signal,
        }
    }

    pub(crate) fn with_refresh(timer: RefreshTimer, close_signal: CancellationToken) -> Self {
        Self {
            refresh: Some(timer),
            close_signal,
        }
    }
}

/// Registry of the links opened through a scope, keyed by link identifier.
///
/// Mutated concurrently by openers (insertion) and by close handlers and the
/// close coordinator (removal). Removal is an atomic remove-and-return: the
/// caller that gets the entry out of the map is the one authorized to tear
/// its timer down, so the map contents are never inspected to decide on
/// disposal.
#[derive(Debug, Clone, Default)]
pub(crate) struct ActiveLinkRegistry {
    inner: Arc<DashMap<u64, LinkEntry>>,
}

impl ActiveLinkRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Tracks a link. Insertion is strict: a duplicate identifier means the
    /// link cannot be created.
    pub(crate) fn register(&self, identifier: u64, entry: LinkEntry) -> Result<(), Error> {
        use dashmap::mapref::entry::Entry;

        match self.inner.entry(identifier) {
            Entry::Occupied(_) => Err(LinkCreationError::Registration.into()),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                debug!(link = identifier, "link registered");
                Ok(())
            }
        }
    }

    /// Hands the spawned refresh task to the tracked entry's timer. Aborts
    /// the task instead when the link was closed in the meantime.
    pub(crate) fn arm_refresh(&self, identifier: u64, task: tokio::task::JoinHandle<()>) -> bool {
        match self.inner.get_mut(&identifier) {
            Some(mut entry) => match entry.refresh.as_mut() {
                Some(timer) => {
                    timer.arm(task);
                    true
                }
                None => {
                    task.abort();
                    false
                }
            },
            None => {
                task.abort();
                false
            }
        }
    }

    /// Stops tracking a link, disposing its refresh timer. Safe to call for
    /// an already-removed link.
    pub(crate) fn unregister(&self, identifier: u64) -> bool {
        match self.inner.remove(&identifier) {
            Some((_, entry)) => {
                if let Some(timer) = &entry.refresh {
                    timer.dispose();
                }
                debug!(link = identifier, "link unregistered");
                true
            }
            None => false,
        }
    }

    /// Force-closes every tracked link: each entry is removed, its timer
    /// disarmed and disposed, and its close signal fired. Entries removed
    /// concurrently are simply skipped.
    pub(crate) fn close_all(&self) {
        let identifiers: Vec<u64> = self.inner.iter().map(|entry| *entry.key()).collect();
        debug!(count = identifiers.len(), "force-closing tracked links");
        for identifier in identifiers {
            if let Some((_, entry)) = self.inner.remove(&identifier) {
                if let Some(timer) = &entry.refresh {
                    timer.dispose();
                }
                entry.close_signal.cancel();
                debug!(link = identifier, "link force-closed");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    #[cfg(test)]
    pub(crate) fn is_tracked(&self, identifier: u64) -> bool {
        self.inner.contains_key(&identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_task() -> tokio::task::JoinHandle<()> {
        tokio::spawn(std::future::pending())
    }

    #[tokio::test]
    async fn duplicate_registration_cannot_create_the_link() {
        let registry = ActiveLinkRegistry::new();
        registry
            .register(7, LinkEntry::new(CancellationToken::new()))
            .unwrap();

        let error = registry
            .register(7, LinkEntry::new(CancellationToken::new()))
            .unwrap_err();
        assert_eq!(error.to_string(), "could not create link");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unregister_removes_the_entry_and_disposes_the_timer() {
        let registry = ActiveLinkRegistry::new();
        let timer_cancel = CancellationToken::new();
        let entry = LinkEntry::with_refresh(
            RefreshTimer::disarmed(timer_cancel.clone()),
            CancellationToken::new(),
        );
        registry.register(1, entry).unwrap();
        registry.arm_refresh(1, pending_task());

        assert!(registry.unregister(1));
        assert!(!registry.is_tracked(1));
        assert!(timer_cancel.is_cancelled());

        // second close handler firing for the same link is a no-op
        assert!(!registry.unregister(1));
    }

    #[tokio::test]
    async fn close_all_fires_every_close_signal_and_disarms_every_timer() {
        let registry = ActiveLinkRegistry::new();

        let producer_timer = CancellationToken::new();
        let producer_signal = CancellationToken::new();
        registry
            .register(
                1,
                LinkEntry::with_refresh(
                    RefreshTimer::disarmed(producer_timer.clone()),
                    producer_signal.clone(),
                ),
            )
            .unwrap();
        registry.arm_refresh(1, pending_task());

        let management_signal = CancellationToken::new();
        registry
            .register(2, LinkEntry::new(management_signal.clone()))
            .unwrap();

        registry.close_all();

        assert_eq!(registry.len(), 0);
        assert!(producer_timer.is_cancelled());
        assert!(producer_signal.is_cancelled());
        assert!(management_signal.is_cancelled());

        // double-fire is harmless
        registry.close_all();
    }

    #[tokio::test]
    async fn arming_after_close_aborts_the_task() {
        let registry = ActiveLinkRegistry::new();
        let timer_cancel = CancellationToken::new();
        registry
            .register(
                9,
                LinkEntry::with_refresh(
                    RefreshTimer::disarmed(timer_cancel.clone()),
                    CancellationToken::new(),
                ),
            )
            .unwrap();
        registry.close_all();

        let task = pending_task();
        assert!(!registry.arm_refresh(9, task));
    }
}
