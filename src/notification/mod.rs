//! Notification records and channel dispatching.

mod dispatcher;
mod types;

pub use dispatcher::{DispatchError, DispatcherStats, DispatcherStatsSnapshot, NotificationDispatcher};
pub use types::{Notification, NotificationBuilder, NotificationStatus};
