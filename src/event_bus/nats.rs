//! NATS JetStream event bus
//!
//! Durable fan-out over a JetStream stream. Events publish to
//! `events.<aggregate_type>.<event_type>` with the event id as the message
//! id, so the stream deduplicates redundant publishes. Subscriptions are
//! durable pull consumers named by the caller; acknowledged progress
//! survives reconnects.

use std::sync::Arc;

use async_nats::jetstream::{self, consumer, stream};
use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;

use crate::config::StreamConfig;
use crate::domain::Event;
use crate::error::{code, AppError, AppResult};

use super::{EventBus, EventFilter, EventHandler, Subscription};

fn transport_error(context: &str, error: impl std::fmt::Display) -> AppError {
    AppError::new(code::TRANSPORT, format!("{context}: {error}"))
}

/// JetStream-backed [`EventBus`].
pub struct NatsEventBus {
    jetstream: jetstream::Context,
    stream: stream::Stream,
    stream_name: String,
}

impl NatsEventBus {
    /// Create or look up the configured stream on an existing connection.
    pub async fn connect(client: async_nats::Client, config: &StreamConfig) -> AppResult<Self> {
        let jetstream = jetstream::new(client);

        let stream = jetstream
            .get_or_create_stream(stream::Config {
                name: config.name.clone(),
                subjects: config.subjects.clone(),
                max_age: config.max_age,
                max_bytes: config.max_bytes,
                ..Default::default()
            })
            .await
            .map_err(|e| transport_error("stream setup failed", e))?;

        Ok(Self {
            jetstream,
            stream,
            stream_name: config.name.clone(),
        })
    }

    fn subject_for(event: &Event) -> String {
        format!("events.{}.{}", event.aggregate_type, event.event_type)
    }

    fn consumer_config(name: &str, filter: &EventFilter) -> consumer::pull::Config {
        let deliver_policy = match filter.from_position {
            Some(position) if position > 0 => consumer::DeliverPolicy::ByStartSequence {
                start_sequence: position as u64 + 1,
            },
            _ => consumer::DeliverPolicy::All,
        };

        // Aggregate-type filters map onto subjects; event-type filters are
        // finer than the subject space and are applied client-side.
        let filter_subjects = match &filter.aggregate_types {
            Some(types) => types.iter().map(|t| format!("events.{t}.>")).collect(),
            None => Vec::new(),
        };

        consumer::pull::Config {
            durable_name: Some(name.to_string()),
            ack_policy: consumer::AckPolicy::Explicit,
            deliver_policy,
            filter_subjects,
            ..Default::default()
        }
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, events: &[Event]) -> AppResult<()> {
        for event in events {
            let payload = serde_json::to_vec(event)
                .map_err(|e| AppError::internal(format!("event serialization failed: {e}")))?;

            let mut headers = HeaderMap::new();
            // JetStream dedup window keys on the message id
            headers.insert("Nats-Msg-Id", event.id.as_str());
            headers.insert("aggregate-id", event.aggregate_id.as_str());

            self.jetstream
                .publish_with_headers(Self::subject_for(event), headers, payload.into())
                .await
                .map_err(|e| transport_error("event publish failed", e))?
                .await
                .map_err(|e| transport_error("event publish not acknowledged", e))?;
        }

        tracing::debug!(count = events.len(), stream = %self.stream_name, "events published");
        Ok(())
    }

    async fn subscribe(
        &self,
        name: &str,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> AppResult<Subscription> {
        let consumer: consumer::PullConsumer = self
            .stream
            .get_or_create_consumer(name, Self::consumer_config(name, &filter))
            .await
            .map_err(|e| transport_error("consumer setup failed", e))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| transport_error("consumer stream failed", e))?;

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let consumer_name = name.to_string();

        let worker = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel_rx.changed() => break,
                    message = messages.next() => match message {
                        Some(Ok(message)) => message,
                        Some(Err(error)) => {
                            tracing::warn!(consumer = %consumer_name, %error, "consumer pull failed");
                            continue;
                        }
                        None => break,
                    },
                };

                let event: Event = match serde_json::from_slice(&message.payload) {
                    Ok(event) => event,
                    Err(error) => {
                        tracing::error!(consumer = %consumer_name, %error, "undecodable event; acking to skip");
                        let _ = message.ack().await;
                        continue;
                    }
                };

                if !filter.matches(&event) {
                    let _ = message.ack().await;
                    continue;
                }

                match handler.handle(&event).await {
                    Ok(()) => {
                        if let Err(error) = message.ack().await {
                            tracing::warn!(consumer = %consumer_name, %error, "ack failed");
                        }
                    }
                    Err(error) => {
                        // Leave unacked; JetStream redelivers after ack_wait.
                        tracing::warn!(
                            consumer = %consumer_name,
                            event_id = %event.id,
                            %error,
                            "event handler failed; awaiting redelivery"
                        );
                    }
                }
            }
        });

        Ok(Subscription::new(cancel_tx, worker))
    }
}
