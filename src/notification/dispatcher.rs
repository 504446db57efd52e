use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

use crate::channels::{Channel, ChannelError, ChannelKind, DispatchResult, WebhookChannel};
use crate::metrics::DispatchMetrics;

use super::Notification;

/// Errors returned by [`NotificationDispatcher::dispatch`].
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("{channel} delivery failed: {source}")]
    Channel {
        channel: ChannelKind,
        #[source]
        source: ChannelError,
    },
}

impl DispatchError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::UnknownChannel(_) => false,
            DispatchError::Channel { source, .. } => !source.is_permanent(),
        }
    }
}

/// Statistics for the notification dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Total dispatch calls
    pub total_dispatched: AtomicU64,
    /// Deliveries reported successful by a channel
    pub total_succeeded: AtomicU64,
    /// Deliveries that failed inside a channel
    pub total_failed: AtomicU64,
    /// Notifications naming no registered channel
    pub unknown_channel: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            total_dispatched: self.total_dispatched.load(Ordering::Relaxed),
            total_succeeded: self.total_succeeded.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            unknown_channel: self.unknown_channel.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub total_dispatched: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub unknown_channel: u64,
}

/// Routes notifications to the channel named by their `channel` field.
///
/// The channel set is fixed at construction; the dispatcher performs no I/O
/// of its own and never retries.
pub struct NotificationDispatcher {
    channels: HashMap<ChannelKind, Channel>,
    stats: DispatcherStats,
}

impl NotificationDispatcher {
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        let channels = channels.into_iter().map(|c| (c.kind(), c)).collect();
        Self {
            channels,
            stats: DispatcherStats::default(),
        }
    }

    /// Get dispatcher statistics
    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Registered channel names, sorted
    pub fn channels(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.channels.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Whether `name` refers to a registered channel.
    pub fn has_channel(&self, name: &str) -> bool {
        name.parse::<ChannelKind>()
            .map(|kind| self.channels.contains_key(&kind))
            .unwrap_or(false)
    }

    /// The webhook channel, used for ad-hoc endpoint tests.
    pub fn webhook(&self) -> Option<&WebhookChannel> {
        match self.channels.get(&ChannelKind::Webhook) {
            Some(Channel::Webhook(webhook)) => Some(webhook),
            _ => None,
        }
    }

    /// Deliver a notification through its channel.
    #[tracing::instrument(
        name = "dispatcher.dispatch",
        skip(self, notification),
        fields(notification_id = %notification.log_id(), channel = %notification.channel)
    )]
    pub async fn dispatch(&self, notification: &Notification) -> Result<DispatchResult, DispatchError> {
        self.stats.total_dispatched.fetch_add(1, Ordering::Relaxed);

        let channel = notification
            .channel
            .parse::<ChannelKind>()
            .ok()
            .and_then(|kind| self.channels.get(&kind));

        let Some(channel) = channel else {
            self.stats.unknown_channel.fetch_add(1, Ordering::Relaxed);
            DispatchMetrics::record_unknown_channel();
            tracing::warn!("Notification names an unregistered channel");
            return Err(DispatchError::UnknownChannel(notification.channel.clone()));
        };

        let kind = channel.kind();
        let started = Instant::now();
        let outcome = channel.send(notification).await;
        DispatchMetrics::record(kind.as_str(), outcome.is_ok(), started.elapsed());

        match outcome {
            Ok(result) => {
                self.stats.total_succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Notification delivered");
                Ok(result)
            }
            Err(source) => {
                self.stats.total_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %source, "Notification delivery failed");
                Err(DispatchError::Channel {
                    channel: kind,
                    source,
                })
            }
        }
    }

    /// Deliver one notification through several channels.
    ///
    /// Every channel is attempted independently; results keep input order.
    pub async fn dispatch_multi(
        &self,
        notification: &Notification,
        channels: &[String],
    ) -> Vec<(String, Result<DispatchResult, DispatchError>)> {
        let sends = channels.iter().map(|name| {
            let mut copy = notification.clone();
            copy.channel = name.clone();
            async move {
                let result = self.dispatch(&copy).await;
                (copy.channel, result)
            }
        });
        futures::future::join_all(sends).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::FileChannel;

    fn file_dispatcher() -> (tempfile::TempDir, NotificationDispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let file = FileChannel::new(dir.path().to_str().unwrap()).unwrap();
        (dir, NotificationDispatcher::new(vec![Channel::from(file)]))
    }

    #[tokio::test]
    async fn test_dispatch_to_registered_channel() {
        let (_dir, dispatcher) = file_dispatcher();
        let notification = Notification::builder("file", "out.log").subject("s").build();

        let result = dispatcher.dispatch(&notification).await.unwrap();

        assert!(result.success);
        assert_eq!(result.channel, "file");
        let stats = dispatcher.stats();
        assert_eq!(stats.total_dispatched, 1);
        assert_eq!(stats.total_succeeded, 1);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_error() {
        let (_dir, dispatcher) = file_dispatcher();

        for name in ["sms", "", "FILE", "email"] {
            let notification = Notification::builder(name, "x").build();
            let err = dispatcher.dispatch(&notification).await.unwrap_err();
            assert!(matches!(err, DispatchError::UnknownChannel(ref n) if n == name));
            assert!(!err.is_retryable());
        }
        assert_eq!(dispatcher.stats().unknown_channel, 4);
    }

    #[tokio::test]
    async fn test_channel_error_carries_channel_name() {
        let (_dir, dispatcher) = file_dispatcher();
        let notification = Notification::builder("file", "../escape.log").build();

        let err = dispatcher.dispatch(&notification).await.unwrap_err();

        assert!(err.to_string().starts_with("file delivery failed"));
        assert!(!err.is_retryable());
        assert_eq!(dispatcher.stats().total_failed, 1);
    }

    #[tokio::test]
    async fn test_dispatch_multi_is_independent() {
        let (_dir, dispatcher) = file_dispatcher();
        let notification = Notification::builder("file", "multi.log").build();
        let channels = vec!["file".to_string(), "pager".to_string(), "file".to_string()];

        let results = dispatcher.dispatch_multi(&notification, &channels).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "file");
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(DispatchError::UnknownChannel(_))));
        assert!(results[2].1.is_ok());
    }

    #[test]
    fn test_registered_channels() {
        let (_dir, dispatcher) = file_dispatcher();
        assert_eq!(dispatcher.channels(), vec!["file"]);
        assert!(dispatcher.has_channel("file"));
        assert!(!dispatcher.has_channel("webhook"));
        assert!(dispatcher.webhook().is_none());
    }
}
