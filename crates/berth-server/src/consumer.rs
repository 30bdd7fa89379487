//! Broker consumer loop
//!
//! One consumer, prefetch 1, manual acknowledgement: the queue is
//! processed serially so lifecycle events keep their order. Handler
//! outcomes map onto the broker as follows: success acks, retryable
//! errors requeue, terminal errors and panics drop the message.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ExchangeKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use berth_common::Error;
use berth_core::Reconciler;

/// Consumer tag registered with the broker.
pub const CONSUMER_TAG: &str = "resource-consumer";

/// Broker topology settings.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Queue to consume from
    pub queue: String,
    /// Direct exchange the queue binds to (empty skips declaration)
    pub exchange: String,
    /// Routing key for the binding
    pub routing_key: String,
}

/// What to do with a delivery after the handler ran.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// Acknowledge: the event is fully processed
    Ack,
    /// Negative-acknowledge with requeue: transient failure
    Requeue,
    /// Negative-acknowledge without requeue: the message can never
    /// succeed (malformed, or the handler panicked)
    Drop,
}

type HandlerOutcome = Result<Result<(), Error>, Box<dyn Any + Send>>;

fn disposition(outcome: &HandlerOutcome) -> Disposition {
    match outcome {
        Ok(Ok(())) => Disposition::Ack,
        Ok(Err(e)) if e.is_retryable() => Disposition::Requeue,
        Ok(Err(_)) => Disposition::Drop,
        Err(_) => Disposition::Drop,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Run the consumer until cancelled or the broker channel closes.
///
/// Declares the durable direct exchange and durable queue, binds them,
/// and consumes with prefetch 1 and manual acknowledgement. On
/// cancellation, the consumer tag is cancelled and the channel closed.
pub async fn run(
    conn: &Connection,
    settings: &BrokerSettings,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let channel = conn.create_channel().await?;

    if !settings.exchange.is_empty() {
        channel
            .exchange_declare(
                &settings.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
    }

    let queue = channel
        .queue_declare(
            &settings.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    let queue_name = queue.name().to_string();

    if !settings.exchange.is_empty() && !settings.routing_key.is_empty() {
        channel
            .queue_bind(
                &queue_name,
                &settings.exchange,
                &settings.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    // One unacknowledged delivery at a time: serial processing keeps
    // event ordering per queue.
    channel.basic_qos(1, BasicQosOptions::default()).await?;

    let mut consumer = channel
        .basic_consume(
            &queue_name,
            CONSUMER_TAG,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!(queue = %queue_name, "broker consumer started, serial mode");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("broker consumer stopping");
                let _ = channel
                    .basic_cancel(CONSUMER_TAG, BasicCancelOptions::default())
                    .await;
                // Drain anything the broker pushed before the cancel-ok.
                while let Some(Ok(delivery)) = consumer.next().await {
                    process_delivery(&reconciler, delivery).await;
                }
                let _ = channel.close(200, "consumer stopped").await;
                return Ok(());
            }
            delivery = consumer.next() => match delivery {
                Some(Ok(delivery)) => process_delivery(&reconciler, delivery).await,
                Some(Err(e)) => {
                    return Err(Error::internal_with_context(
                        "consumer",
                        format!("delivery error: {e}"),
                    ));
                }
                None => {
                    return Err(Error::internal_with_context(
                        "consumer",
                        "broker channel closed",
                    ));
                }
            },
        }
    }
}

async fn process_delivery(reconciler: &Reconciler, delivery: Delivery) {
    debug!(
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        bytes = delivery.data.len(),
        "processing delivery"
    );

    let outcome = AssertUnwindSafe(reconciler.handle_message(&delivery.data))
        .catch_unwind()
        .await;

    match disposition(&outcome) {
        Disposition::Ack => {
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %e, "failed to ack message");
            } else {
                debug!("message handled and acked");
            }
        }
        Disposition::Requeue => {
            if let Ok(Err(handler_err)) = &outcome {
                warn!(error = %handler_err, "handler failed, requeueing message");
            }
            if let Err(e) = delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            {
                error!(error = %e, "failed to nack message for requeue");
            }
        }
        Disposition::Drop => {
            match &outcome {
                Ok(Err(handler_err)) => {
                    warn!(error = %handler_err, "dropping unprocessable message")
                }
                Err(payload) => {
                    error!(panic = panic_message(payload.as_ref()), "panic in handler, dropping message")
                }
                Ok(Ok(())) => {}
            }
            if let Err(e) = delivery
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await
            {
                error!(error = %e, "failed to drop message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn outcome_of<F>(fut: F) -> HandlerOutcome
    where
        F: std::future::Future<Output = Result<(), Error>>,
    {
        AssertUnwindSafe(fut).catch_unwind().await
    }

    #[tokio::test]
    async fn success_acks() {
        let outcome = outcome_of(async { Ok(()) }).await;
        assert_eq!(disposition(&outcome), Disposition::Ack);
    }

    #[tokio::test]
    async fn transient_handler_error_requeues() {
        let outcome = outcome_of(async { Err(Error::internal("db down")) }).await;
        assert_eq!(disposition(&outcome), Disposition::Requeue);
    }

    #[tokio::test]
    async fn validation_error_drops() {
        let outcome = outcome_of(async { Err(Error::invalid_argument("bad event")) }).await;
        assert_eq!(disposition(&outcome), Disposition::Drop);
    }

    #[tokio::test]
    async fn panic_drops() {
        let outcome = outcome_of(async { panic!("boom") }).await;
        assert_eq!(disposition(&outcome), Disposition::Drop);
        match outcome {
            Err(payload) => assert_eq!(panic_message(payload.as_ref()), "boom"),
            Ok(_) => panic!("expected a panic outcome"),
        }
    }
}
