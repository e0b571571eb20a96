//! Watch events and streams

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::resources::Resource;

/// Notification of a committed mutation
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    /// A resource was created; carries the stored snapshot
    Created(Resource),
    /// A resource was updated; carries the new snapshot
    Updated(Resource),
    /// A resource was destroyed; carries its last snapshot
    Destroyed(Resource),
    /// The watcher fell behind and `missed` events were dropped
    ///
    /// Consumers must re-list to recover current state.
    Resync {
        /// Number of dropped events
        missed: u64,
    },
}

impl WatchEvent {
    /// Resource the event refers to, `None` for resync markers
    pub fn resource(&self) -> Option<&Resource> {
        match self {
            Self::Created(r) | Self::Updated(r) | Self::Destroyed(r) => Some(r),
            Self::Resync { .. } => None,
        }
    }
}

/// Lazy, unbounded sequence of watch events
///
/// Dropping the stream ends the subscription.
pub type WatchStream = BoxStream<'static, WatchEvent>;

pub(super) fn into_stream(rx: broadcast::Receiver<WatchEvent>, id: Option<String>) -> WatchStream {
    BroadcastStream::new(rx)
        .filter_map(move |item| {
            let event = match item {
                Ok(event) => match (&id, event.resource()) {
                    (Some(id), Some(resource)) if resource.id() != id => None,
                    _ => Some(event),
                },
                Err(BroadcastStreamRecvError::Lagged(missed)) => Some(WatchEvent::Resync { missed }),
            };
            futures::future::ready(event)
        })
        .boxed()
}
