//! Status notifications back to whoever asked for an operation.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::{DeploymentId, OwnerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    Deployed {
        deployment_id: DeploymentId,
        pid: i32,
        secret_var: String,
    },
    /// Something went wrong that did not stop the deployment.
    Warning { message: String },
    Aborted { reason: String },
    Terminated {
        deployment_id: DeploymentId,
        removed: bool,
    },
}

/// A notice addressed to one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusNotification {
    pub owner: OwnerId,
    #[serde(flatten)]
    pub notice: Notice,
}

/// Output channel for status notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: StatusNotification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: StatusNotification) {
        match &n.notice {
            Notice::Warning { message } => warn!(owner = %n.owner, %message, "deploy warning"),
            Notice::Aborted { reason } => warn!(owner = %n.owner, %reason, "deploy aborted"),
            notice => info!(owner = %n.owner, ?notice, "status"),
        }
    }
}

/// Forwards notifications into a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<StatusNotification>,
}

impl ChannelNotifier {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: StatusNotification) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.tx.send(notification);
    }
}
