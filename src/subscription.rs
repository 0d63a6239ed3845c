//! Channel subscriptions that outlive individual connections.
//!
//! The registry holds the desired set of channels. It is owned by the client actor, so every
//! transition happens inside one message handler and never races with connection churn.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::core::{ClientError, ClientResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Error,
}

/// Snapshot of a subscription as seen by its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub state: SubscriptionState,
    pub last_error: Option<ClientError>,
}

impl SubscriptionStatus {
    fn subscribing() -> Self {
        Self {
            state: SubscriptionState::Subscribing,
            last_error: None,
        }
    }
}

/// Data published into a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub channel: String,
    pub data: Bytes,
}

pub type TokenFuture = Pin<Box<dyn Future<Output = Result<String, String>> + Send>>;

/// Source of per-channel tokens for private channels.
///
/// Called once per subscribe attempt, replays after a reconnect included.
pub trait TokenProvider: Send + Sync + 'static {
    fn fetch_token(&self, channel: &str) -> TokenFuture;
}

impl<F, Fut> TokenProvider for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    fn fetch_token(&self, channel: &str) -> TokenFuture {
        Box::pin(self(channel.to_string()))
    }
}

/// Caller-side view of one subscription.
///
/// Dropping the handle does not unsubscribe; use [`crate::Client::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    status: watch::Receiver<SubscriptionStatus>,
    publications: mpsc::UnboundedReceiver<Publication>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SubscriptionState {
        self.status.borrow().state
    }

    pub fn last_error(&self) -> Option<ClientError> {
        self.status.borrow().last_error.clone()
    }

    /// Wait until the server acknowledged the subscription.
    ///
    /// Returns the attached error when the subscribe request was rejected or the token fetch
    /// failed, and [`ClientError::ClientClosed`] once the subscription was removed.
    pub async fn wait_subscribed(&mut self) -> ClientResult<()> {
        let status = self
            .status
            .wait_for(|status| status.state != SubscriptionState::Subscribing)
            .await
            .map_err(|_| ClientError::ClientClosed)?
            .clone();
        match status.state {
            SubscriptionState::Subscribed => Ok(()),
            _ => Err(status.last_error.unwrap_or(ClientError::ClientClosed)),
        }
    }

    /// Next publication on this channel; `None` once the subscription is gone.
    pub async fn next_publication(&mut self) -> Option<Publication> {
        self.publications.recv().await
    }

    pub fn try_next_publication(&mut self) -> Option<Publication> {
        self.publications.try_recv().ok()
    }
}

struct Entry {
    seq: u64,
    status: watch::Sender<SubscriptionStatus>,
    publications: mpsc::UnboundedSender<Publication>,
}

impl Entry {
    fn state(&self) -> SubscriptionState {
        self.status.borrow().state
    }

    fn set(&self, state: SubscriptionState, last_error: Option<ClientError>) {
        self.status.send_replace(SubscriptionStatus { state, last_error });
    }
}

/// Channel name to subscription state, keyed uniquely by channel.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.entries.contains_key(channel)
    }

    pub fn state(&self, channel: &str) -> Option<SubscriptionState> {
        self.entries.get(channel).map(Entry::state)
    }

    /// Generation of the live entry for `channel`. A channel that is unsubscribed and
    /// subscribed again gets a new one, so replies to requests made for the old entry can
    /// be told apart.
    pub fn seq(&self, channel: &str) -> Option<u64> {
        self.entries.get(channel).map(|entry| entry.seq)
    }

    /// Insert `channel` as `Subscribing`. An existing entry, in any state, is left untouched.
    pub fn subscribe(&mut self, channel: &str) -> ClientResult<Subscription> {
        if self.entries.contains_key(channel) {
            return Err(ClientError::DuplicateSubscription);
        }
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::subscribing());
        let (pub_tx, pub_rx) = mpsc::unbounded_channel();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            channel.to_string(),
            Entry {
                seq,
                status: status_tx,
                publications: pub_tx,
            },
        );
        Ok(Subscription {
            channel: channel.to_string(),
            status: status_rx,
            publications: pub_rx,
        })
    }

    /// Remove `channel`. Returns whether it was present.
    pub fn unsubscribe(&mut self, channel: &str) -> bool {
        match self.entries.remove(channel) {
            Some(entry) => {
                entry.set(SubscriptionState::Unsubscribed, None);
                true
            }
            None => false,
        }
    }

    /// Channels in original subscribe order.
    pub fn channels(&self) -> Vec<String> {
        let mut ordered: Vec<(&String, u64)> = self
            .entries
            .iter()
            .map(|(channel, entry)| (channel, entry.seq))
            .collect();
        ordered.sort_unstable_by_key(|(_, seq)| *seq);
        ordered.into_iter().map(|(channel, _)| channel.clone()).collect()
    }

    /// Reset every live entry to `Subscribing` and return the channels to resend, in
    /// original subscribe order.
    pub fn on_reconnected(&mut self) -> Vec<String> {
        let channels = self.channels();
        for channel in &channels {
            if let Some(entry) = self.entries.get(channel) {
                if entry.state() != SubscriptionState::Unsubscribed {
                    entry.set(SubscriptionState::Subscribing, None);
                }
            }
        }
        channels
    }

    /// Subscribed entries revert to `Subscribing` until the next connection replays them.
    pub fn on_disconnected(&mut self) {
        for entry in self.entries.values() {
            if entry.state() == SubscriptionState::Subscribed {
                entry.set(SubscriptionState::Subscribing, None);
            }
        }
    }

    /// Apply the outcome of a subscribe request. Returns `false` for unknown channels.
    pub fn on_subscribe_ack(&mut self, channel: &str, outcome: ClientResult<()>) -> bool {
        let Some(entry) = self.entries.get(channel) else {
            return false;
        };
        match outcome {
            Ok(()) => entry.set(SubscriptionState::Subscribed, None),
            Err(err) => entry.set(SubscriptionState::Error, Some(err)),
        }
        true
    }

    /// Route a publication to its channel's handle.
    pub fn dispatch(&self, publication: Publication) -> bool {
        match self.entries.get(&publication.channel) {
            Some(entry) => entry.publications.send(publication).is_ok(),
            None => false,
        }
    }

    /// Drop every entry, leaving `error` on each handle.
    pub fn clear(&mut self, error: ClientError) {
        for (_, entry) in self.entries.drain() {
            entry.set(SubscriptionState::Unsubscribed, Some(error.clone()));
        }
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_subscribe_leaves_existing_entry_alone() {
        let mut registry = SubscriptionRegistry::new();
        let first = registry.subscribe("news").unwrap();
        assert!(registry.on_subscribe_ack("news", Ok(())));
        assert_eq!(first.state(), SubscriptionState::Subscribed);

        let err = registry.subscribe("news").unwrap_err();
        assert_eq!(err, ClientError::DuplicateSubscription);
        assert_eq!(first.state(), SubscriptionState::Subscribed);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resubscribe_gets_a_new_generation() {
        let mut registry = SubscriptionRegistry::new();
        let _first = registry.subscribe("news").unwrap();
        let first_seq = registry.seq("news").unwrap();
        assert!(registry.unsubscribe("news"));
        assert_eq!(registry.seq("news"), None);

        let _second = registry.subscribe("news").unwrap();
        assert_ne!(registry.seq("news"), Some(first_seq));
    }

    #[test]
    fn replay_follows_subscribe_order() {
        let mut registry = SubscriptionRegistry::new();
        let _c = registry.subscribe("c").unwrap();
        let _a = registry.subscribe("a").unwrap();
        let b = registry.subscribe("b").unwrap();
        for channel in ["c", "a", "b"] {
            registry.on_subscribe_ack(channel, Ok(()));
        }

        registry.on_disconnected();
        assert_eq!(b.state(), SubscriptionState::Subscribing);
        assert_eq!(registry.on_reconnected(), vec!["c", "a", "b"]);

        assert!(registry.unsubscribe("a"));
        let _d = registry.subscribe("d").unwrap();
        assert_eq!(registry.on_reconnected(), vec!["c", "b", "d"]);
    }

    #[test]
    fn failed_ack_attaches_error_and_replay_clears_it() {
        let mut registry = SubscriptionRegistry::new();
        let sub = registry.subscribe("secret").unwrap();
        let err = ClientError::Server {
            code: 103,
            message: "permission denied".to_string(),
        };
        registry.on_subscribe_ack("secret", Err(err.clone()));
        assert_eq!(sub.state(), SubscriptionState::Error);
        assert_eq!(sub.last_error(), Some(err));

        registry.on_reconnected();
        assert_eq!(sub.state(), SubscriptionState::Subscribing);
        assert_eq!(sub.last_error(), None);
    }

    #[test]
    fn unsubscribe_unknown_channel_reports_absent() {
        let mut registry = SubscriptionRegistry::new();
        assert!(!registry.unsubscribe("missing"));
        assert!(!registry.on_subscribe_ack("missing", Ok(())));
    }

    #[tokio::test]
    async fn publications_reach_the_matching_handle() {
        let mut registry = SubscriptionRegistry::new();
        let mut news = registry.subscribe("news").unwrap();
        let mut chat = registry.subscribe("chat").unwrap();

        assert!(registry.dispatch(Publication {
            channel: "news".to_string(),
            data: Bytes::from_static(b"1"),
        }));
        assert!(!registry.dispatch(Publication {
            channel: "other".to_string(),
            data: Bytes::from_static(b"2"),
        }));

        let publication = news.next_publication().await.unwrap();
        assert_eq!(publication.data.as_ref(), b"1");
        assert!(chat.try_next_publication().is_none());
    }

    #[tokio::test]
    async fn wait_subscribed_resolves_on_ack_and_on_clear() {
        let mut registry = SubscriptionRegistry::new();
        let mut ok = registry.subscribe("ok").unwrap();
        let mut pending = registry.subscribe("pending").unwrap();

        registry.on_subscribe_ack("ok", Ok(()));
        ok.wait_subscribed().await.unwrap();

        registry.clear(ClientError::ClientClosed);
        assert_eq!(
            pending.wait_subscribed().await.unwrap_err(),
            ClientError::ClientClosed
        );
        assert_eq!(pending.state(), SubscriptionState::Unsubscribed);
        assert!(registry.is_empty());
        assert!(pending.next_publication().await.is_none());
    }
}
