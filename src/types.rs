use std::fmt::Debug;

use alloy::primitives::B256;
use serde::Serialize;

use crate::{ListenerError, log_entry::LogPosition, log_poller::queue};

/// Item carried on a poller stream: either data or an engine notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerMessage<T> {
    Data(T),
    Notification(Notification),
}

/// Out-of-band events emitted by the poller between data items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Historical catch-up is complete and the poller is tailing the head. Sent once per session.
    SwitchingToLive,
    /// Previously delivered data was orphaned by a chain reorganization.
    ReorgDetected(ReorgReport),
}

/// Details of a reorganization the poller recovered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReorgReport {
    /// Newest tracked block that is still canonical. Delivery resumes right after it.
    pub common_ancestor: u64,
    /// Hash of the common ancestor block.
    pub ancestor_hash: B256,
    /// Delivered log positions above the common ancestor, in ascending order.
    pub invalidated: Vec<LogPosition>,
    /// The divergence reached past every tracked block, so the ancestor is a best guess.
    pub beyond_history: bool,
}

impl<T> From<Notification> for ListenerMessage<T> {
    fn from(value: Notification) -> Self {
        ListenerMessage::Notification(value)
    }
}

impl<T> PartialEq<Notification> for ListenerMessage<T> {
    fn eq(&self, other: &Notification) -> bool {
        if let ListenerMessage::Notification(notification) = self {
            notification == other
        } else {
            false
        }
    }
}

pub type ListenerResult<T> = Result<ListenerMessage<T>, ListenerError>;

pub trait IntoListenerResult<T> {
    fn into_listener_result(self) -> ListenerResult<T>;
}

impl<T> IntoListenerResult<T> for ListenerMessage<T> {
    fn into_listener_result(self) -> ListenerResult<T> {
        Ok(self)
    }
}

impl<T> IntoListenerResult<T> for ListenerError {
    fn into_listener_result(self) -> ListenerResult<T> {
        Err(self)
    }
}

impl<T> IntoListenerResult<T> for Notification {
    fn into_listener_result(self) -> ListenerResult<T> {
        Ok(ListenerMessage::Notification(self))
    }
}

pub(crate) trait TryStream<T> {
    async fn try_stream<M: IntoListenerResult<T>>(&self, msg: M) -> bool;
}

impl<T: Debug> TryStream<T> for queue::Sender<ListenerResult<T>> {
    async fn try_stream<M: IntoListenerResult<T>>(&self, msg: M) -> bool {
        let item = msg.into_listener_result();
        match &item {
            Ok(msg) => trace!(item = ?msg, "Queueing message"),
            Err(err) => debug!(error = %err, "Queueing error"),
        }
        if self.send(item).await.is_err() {
            warn!("Downstream queue closed, stopping poller");
            return false;
        }
        true
    }
}
