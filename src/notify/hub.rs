use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{GenerationJob, JobStatus, JobType, Notification};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Notification,
    JobStatus,
    Keepalive,
}

/// Snapshot of a job carried on the live stream. Clients treat it as a hint
/// and re-fetch the job for the authoritative state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatusEvent {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub parent_job_id: Option<String>,
    pub progress_percent: i32,
    pub progress_message: Option<String>,
    pub error_message: Option<String>,
}

impl From<&GenerationJob> for JobStatusEvent {
    fn from(job: &GenerationJob) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            status: job.status,
            parent_job_id: job.parent_job_id.clone(),
            progress_percent: job.progress_percent,
            progress_message: job.progress_message.clone(),
            error_message: job.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserEvent {
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<Notification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobStatusEvent>,
}

impl UserEvent {
    pub fn keepalive() -> Self {
        Self {
            event_type: EventType::Keepalive,
            notification: None,
            job: None,
        }
    }

    pub fn notification(notification: Notification) -> Self {
        Self {
            event_type: EventType::Notification,
            notification: Some(notification),
            job: None,
        }
    }

    pub fn job_status(job: &GenerationJob) -> Self {
        Self {
            event_type: EventType::JobStatus,
            notification: None,
            job: Some(job.into()),
        }
    }

    pub fn is_keepalive(&self) -> bool {
        self.event_type == EventType::Keepalive
    }
}

/// Per-user broadcast topics.
///
/// Each topic is a bounded `broadcast` channel: publishing never waits, and
/// a subscriber that falls more than `buffer` events behind loses the oldest
/// ones. Topics are created on first subscribe and pruned when their last
/// subscription drops.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    topics: Arc<DashMap<String, broadcast::Sender<UserEvent>>>,
    buffer: usize,
}

impl NotificationHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe_user_events(&self, user_id: &str) -> (Subscription, Unsubscribe) {
        let rx = self
            .topics
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .subscribe();
        let token = CancellationToken::new();
        debug!(user_id, "subscribed to user events");
        (
            Subscription {
                user_id: user_id.to_string(),
                rx: Some(rx),
                token: token.clone(),
                topics: Arc::clone(&self.topics),
            },
            Unsubscribe { token },
        )
    }

    /// Fan `event` out to every live subscription of `user_id`. Returns the
    /// number of subscriptions that received it.
    pub fn publish(&self, user_id: &str, event: UserEvent) -> usize {
        match self.topics.get(user_id) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Tear down a user's topic; open subscriptions end after draining.
    pub fn close_user(&self, user_id: &str) {
        self.topics.remove(user_id);
    }

    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.topics
            .get(user_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

/// Receiving half of a user subscription.
#[derive(Debug)]
pub struct Subscription {
    user_id: String,
    rx: Option<broadcast::Receiver<UserEvent>>,
    token: CancellationToken,
    topics: Arc<DashMap<String, broadcast::Sender<UserEvent>>>,
}

impl Subscription {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Next event, or `None` once the subscription is cancelled or its topic
    /// is closed. Skips over events lost to lagging.
    pub async fn recv(&mut self) -> Option<UserEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                res = rx.recv() => match res {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(user_id = %self.user_id, skipped, "subscriber lagging, oldest events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.rx.take());
        self.topics
            .remove_if(&self.user_id, |_, tx| tx.receiver_count() == 0);
    }
}

/// Cancel handle for a `Subscription`.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    token: CancellationToken,
}

impl Unsubscribe {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscription() {
        let hub = NotificationHub::new(8);
        let (mut a, _ua) = hub.subscribe_user_events("u1");
        let (mut b, _ub) = hub.subscribe_user_events("u1");
        let (mut other, _uo) = hub.subscribe_user_events("u2");

        assert_eq!(hub.publish("u1", UserEvent::keepalive()), 2);
        assert!(a.recv().await.unwrap().is_keepalive());
        assert!(b.recv().await.unwrap().is_keepalive());

        hub.close_user("u2");
        assert!(other.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_ends_stream_and_prunes_topic() {
        let hub = NotificationHub::new(8);
        let (mut sub, unsubscribe) = hub.subscribe_user_events("u1");
        assert_eq!(hub.subscriber_count("u1"), 1);

        unsubscribe.cancel();
        assert!(sub.recv().await.is_none());
        drop(sub);
        assert_eq!(hub.subscriber_count("u1"), 0);
        assert_eq!(hub.publish("u1", UserEvent::keepalive()), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_keeps_newest_events() {
        let hub = NotificationHub::new(2);
        let (mut slow, _u) = hub.subscribe_user_events("u1");
        for _ in 0..5 {
            hub.publish("u1", UserEvent::keepalive());
        }
        // Publishing never blocked; the slow reader sees only what fits.
        let mut received = 0;
        hub.close_user("u1");
        while slow.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 2);
    }
}
