//! Consume loop driving the [`MessageBridge`]
//!
//! One task pulls messages off the delivery queue and hands them to the bridge, one at a
//! time, in delivery order. The wait for the next message is the only suspension point
//! and is raced against a shutdown token.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::BridgeError;
use super::handler::MessageBridge;
use crate::mqtt::message_manager::InboundMessage;
use crate::store::RecordStore;

/// Source of inbound messages for the consume loop
pub trait Subscription {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Resolves to `None` once the delivery queue is closed for good
    fn next_message(&mut self) -> impl Future<Output = Option<InboundMessage>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown token was cancelled
    Cancelled,
    /// The delivery queue closed, usually because the connection is gone
    QueueClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub forwarded: u64,
    pub skipped: u64,
    pub stop: StopReason,
}

/// Result of a whole session: the consume loop and the disconnect that follows it
#[derive(Debug)]
pub struct SessionOutcome<E> {
    pub consume: Result<ConsumeSummary, BridgeError>,
    pub disconnect: Result<(), E>,
}

/// Runs until cancelled, until the queue closes, or until a store write fails
pub async fn consume<Sub, S>(
    subscription: &mut Sub,
    bridge: &mut MessageBridge<S>,
    shutdown: &CancellationToken,
) -> Result<ConsumeSummary, BridgeError>
where
    Sub: Subscription,
    S: RecordStore,
{
    let mut forwarded = 0;
    let mut skipped = 0;

    let stop = loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break StopReason::Cancelled,
            next = subscription.next_message() => next,
        };

        let Some(message) = next else {
            break StopReason::QueueClosed;
        };
        debug!("Received {}", message.render());

        match bridge.handle(&message) {
            Ok(_) => forwarded += 1,
            Err(e) if e.is_fatal() => {
                error!("Stopping consume loop: {}", e);
                return Err(e);
            }
            Err(e) => {
                warn!("Skipping message: {}", e);
                skipped += 1;
            }
        }
    };

    info!(
        "Consume loop stopped ({:?}) after {} forwarded, {} skipped",
        stop, forwarded, skipped
    );
    Ok(ConsumeSummary {
        forwarded,
        skipped,
        stop,
    })
}

/// Consumes, then disconnects exactly once whatever the loop's outcome
pub async fn run_session<Sub, S>(
    subscription: &mut Sub,
    bridge: &mut MessageBridge<S>,
    shutdown: &CancellationToken,
) -> SessionOutcome<Sub::Error>
where
    Sub: Subscription,
    S: RecordStore,
{
    let consume = consume(subscription, bridge, shutdown).await;
    let disconnect = subscription.disconnect().await;
    SessionOutcome {
        consume,
        disconnect,
    }
}
