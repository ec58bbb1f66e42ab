//! Bridges a user subscription to a long-lived client connection.
//!
//! The bridge waits on three sources at once: the next event, the heartbeat
//! tick and the client going away. Keepalives are emitted on a fixed interval
//! regardless of traffic so intermediaries never see an idle connection.

use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::hub::{Subscription, UserEvent};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

/// Why a bridge stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// The client's request context was cancelled.
    ClientDisconnected,
    /// The subscription ended on the server side.
    StreamClosed,
    /// The connection refused further writes.
    SinkClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Write side of a client connection.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: UserEvent) -> Result<(), SinkClosed>;
}

#[async_trait]
impl EventSink for mpsc::Sender<UserEvent> {
    async fn deliver(&self, event: UserEvent) -> Result<(), SinkClosed> {
        self.send(event).await.map_err(|_| SinkClosed)
    }
}

fn heartbeat_ticker(heartbeat: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

enum Next {
    Event(UserEvent),
    Tick,
    Exit(BridgeExit),
}

async fn next(
    sub: &mut Subscription,
    ticker: &mut Interval,
    client: &CancellationToken,
) -> Next {
    tokio::select! {
        biased;
        _ = client.cancelled() => Next::Exit(BridgeExit::ClientDisconnected),
        // Ahead of `recv` so a busy topic cannot starve keepalives.
        _ = ticker.tick() => Next::Tick,
        event = sub.recv() => match event {
            Some(event) => Next::Event(event),
            None => Next::Exit(BridgeExit::StreamClosed),
        },
    }
}

/// Pump `sub` into `sink` until the client disconnects, the subscription
/// closes or the sink stops accepting events.
pub async fn run_bridge<S>(
    mut sub: Subscription,
    heartbeat: Duration,
    client: CancellationToken,
    sink: &S,
) -> BridgeExit
where
    S: EventSink + ?Sized,
{
    let mut ticker = heartbeat_ticker(heartbeat);
    loop {
        let event = match next(&mut sub, &mut ticker, &client).await {
            Next::Event(event) => event,
            Next::Tick => UserEvent::keepalive(),
            Next::Exit(reason) => {
                debug!(user_id = sub.user_id(), ?reason, "bridge finished");
                return reason;
            }
        };
        if sink.deliver(event).await.is_err() {
            debug!(user_id = sub.user_id(), "client sink closed");
            return BridgeExit::SinkClosed;
        }
    }
}

/// The same bridge as a `Stream`, ending cleanly on either exit condition.
pub fn event_stream(
    sub: Subscription,
    heartbeat: Duration,
    client: CancellationToken,
) -> impl Stream<Item = UserEvent> + Send {
    let ticker = heartbeat_ticker(heartbeat);
    stream::unfold(
        (sub, ticker, client),
        |(mut sub, mut ticker, client)| async move {
            match next(&mut sub, &mut ticker, &client).await {
                Next::Event(event) => Some((event, (sub, ticker, client))),
                Next::Tick => Some((UserEvent::keepalive(), (sub, ticker, client))),
                Next::Exit(_) => None,
            }
        },
    )
}
