//! NATS command transport
//!
//! Request/reply dispatch on `commands.<command_type>`. The sending side
//! retries optimistic-conflict replies with exponential backoff inside the
//! caller's deadline; the receiving side serves a queue group and routes
//! into the same local registry and middleware chain used in-process.

use std::sync::Arc;
use std::time::Duration;

use async_nats::{ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::TransportConfig;
use crate::domain::{CommandEnvelope, OperationContext};
use crate::error::{code, AppError, AppResult, Response};
use crate::observability::TraceContext;

use super::{CommandBus, CommandHandler, LocalCommandBus, Middleware};

pub const HEADER_MESSAGE_TYPE: &str = "message-type";
pub const HEADER_TENANT_ID: &str = "tenant-id";
pub const HEADER_TRACE_ID: &str = "trace-id";
pub const HEADER_TRACEPARENT: &str = "traceparent";

fn transport_error(context: &str, error: impl std::fmt::Display) -> AppError {
    AppError::new(code::TRANSPORT, format!("{context}: {error}"))
}

/// Distributed [`CommandBus`] over NATS request/reply.
pub struct NatsCommandBus {
    client: async_nats::Client,
    config: TransportConfig,
    local: Arc<LocalCommandBus>,
}

impl NatsCommandBus {
    /// Connect to the configured server, applying credentials and reconnect
    /// settings.
    pub async fn connect(config: TransportConfig) -> AppResult<Self> {
        let mut options = ConnectOptions::new()
            .name(config.name.clone())
            .request_timeout(Some(config.timeout))
            .max_reconnects(config.max_reconnect_attempts);

        let reconnect_wait = config.reconnect_wait;
        options = options.reconnect_delay_callback(move |_attempt| reconnect_wait);

        if let Some(credentials) = &config.credentials {
            options = credentials.apply(options).await?;
        }

        let client = async_nats::connect_with_options(config.url.clone(), options)
            .await
            .map_err(|e| transport_error("connection failed", e))?;

        tracing::info!(url = %config.url, name = %config.name, "connected to NATS");

        Ok(Self {
            client,
            config,
            local: Arc::new(LocalCommandBus::new()),
        })
    }

    /// The underlying connection, for wiring an event bus onto it.
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    fn subject_for(command_type: &str) -> String {
        format!("commands.{command_type}")
    }

    fn headers_for(&self, ctx: &OperationContext, envelope: &CommandEnvelope) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_MESSAGE_TYPE, envelope.command_type.as_str());
        if let Some(tenant_id) = envelope.metadata.tenant_id.as_deref().or(ctx.tenant_id.as_deref())
        {
            headers.insert(HEADER_TENANT_ID, tenant_id);
        }

        // Propagate the active trace, starting one if the caller has none
        let trace = ctx
            .trace
            .as_ref()
            .map(TraceContext::child)
            .unwrap_or_else(TraceContext::generate);
        headers.insert(HEADER_TRACE_ID, trace.trace_id.as_str());
        headers.insert(HEADER_TRACEPARENT, trace.to_traceparent().as_str());
        headers
    }

    /// Start serving every registered command type on the configured queue
    /// group. Registrations must happen before this call.
    pub async fn serve(&self) -> AppResult<ServerHandle> {
        let (shutdown_tx, _) = watch::channel(false);
        let mut workers = Vec::new();

        for command_type in self.local.registered_types() {
            let subject = Self::subject_for(&command_type);
            let mut subscriber = self
                .client
                .queue_subscribe(subject.clone(), self.config.queue_group.clone())
                .await
                .map_err(|e| transport_error("queue subscribe failed", e))?;

            tracing::info!(subject = %subject, queue_group = %self.config.queue_group, "serving commands");

            let client = self.client.clone();
            let local = self.local.clone();
            let mut shutdown = shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = shutdown.changed() => break,
                        message = subscriber.next() => match message {
                            Some(message) => message,
                            None => break,
                        },
                    };

                    let response = Self::dispatch(&local, &message).await;
                    let Some(reply) = message.reply.clone() else {
                        continue;
                    };
                    match serde_json::to_vec(&response) {
                        Ok(bytes) => {
                            if let Err(error) = client.publish(reply, bytes.into()).await {
                                tracing::warn!(%error, "reply publish failed");
                            }
                        }
                        Err(error) => {
                            tracing::error!(%error, "reply serialization failed");
                        }
                    }
                }
                let _ = subscriber.unsubscribe().await;
            }));
        }

        Ok(ServerHandle {
            shutdown: shutdown_tx,
            workers,
        })
    }

    async fn dispatch(local: &LocalCommandBus, message: &async_nats::Message) -> Response {
        let envelope: CommandEnvelope = match serde_json::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                return Response::err(AppError::new(
                    code::INVALID_COMMAND,
                    format!("undecodable command envelope: {error}"),
                ));
            }
        };

        let mut ctx = OperationContext::new()
            .with_causation_id(envelope.metadata.command_id.clone());
        ctx.principal_id = envelope.metadata.principal_id.clone();
        ctx.tenant_id = envelope.metadata.tenant_id.clone();
        ctx.correlation_id = envelope.metadata.correlation_id.clone();
        if let Some(headers) = &message.headers {
            ctx.trace = headers
                .get(HEADER_TRACEPARENT)
                .and_then(|value| TraceContext::from_traceparent(value.as_str()));
        }

        match local.send(&ctx, &envelope).await {
            Ok(response) => response,
            Err(error) => Response::err(error),
        }
    }

    /// Flush pending traffic and drop the connection, bounded by `grace`.
    ///
    /// Stop command serving first ([`ServerHandle::shutdown`]); drain only
    /// settles what is already in flight.
    pub async fn drain(self, grace: Duration) -> AppResult<()> {
        match tokio::time::timeout(grace, self.client.flush()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(transport_error("flush failed", error)),
            Err(_) => Err(AppError::timeout(format!(
                "drain did not complete within {grace:?}"
            ))),
        }
    }

    /// [`drain`](Self::drain) with the transport's default timeout as the
    /// grace period.
    pub async fn close(self) -> AppResult<()> {
        let grace = self.config.timeout;
        self.drain(grace).await
    }
}

#[async_trait]
impl CommandBus for NatsCommandBus {
    fn register(&self, command_type: &str, handler: Arc<dyn CommandHandler>) {
        self.local.register(command_type, handler);
    }

    fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.local.use_middleware(middleware);
    }

    async fn send(
        &self,
        ctx: &OperationContext,
        envelope: &CommandEnvelope,
    ) -> AppResult<Response> {
        let subject = Self::subject_for(&envelope.command_type);
        let headers = self.headers_for(ctx, envelope);
        let payload = serde_json::to_vec(envelope)
            .map_err(|e| AppError::internal(format!("envelope serialization failed: {e}")))?;

        let mut attempt = 0u32;
        loop {
            if ctx.is_expired() {
                return Ok(Response::err(AppError::timeout(format!(
                    "deadline expired before sending {}",
                    envelope.command_type
                ))));
            }

            let timeout = ctx.effective_timeout(self.config.timeout);
            let request = self.client.request_with_headers(
                subject.clone(),
                headers.clone(),
                payload.clone().into(),
            );

            let message = match tokio::time::timeout(timeout, request).await {
                Err(_) => {
                    // Synthetic timeout response; never retried
                    return Ok(Response::err(AppError::timeout(format!(
                        "no reply for {} within {timeout:?}",
                        envelope.command_type
                    ))));
                }
                Ok(Err(error)) if error.kind() == async_nats::RequestErrorKind::TimedOut => {
                    return Ok(Response::err(AppError::timeout(format!(
                        "no reply for {} within {timeout:?}",
                        envelope.command_type
                    ))));
                }
                Ok(Err(error)) => return Err(transport_error("request failed", error)),
                Ok(Ok(message)) => message,
            };

            let response: Response = serde_json::from_slice(&message.payload)
                .map_err(|e| transport_error("undecodable reply", e))?;

            let retryable = response
                .error
                .as_ref()
                .map(AppError::is_retryable_conflict)
                .unwrap_or(false);
            if !response.success && retryable && attempt < self.config.max_retries {
                let delay = Duration::from_millis(10 * (1 << attempt));
                if matches!(ctx.remaining(), Some(remaining) if remaining <= delay) {
                    return Ok(response);
                }
                tracing::warn!(
                    command_type = %envelope.command_type,
                    attempt = attempt + 1,
                    max_retries = self.config.max_retries,
                    "conflict reply, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return Ok(response);
        }
    }
}

/// Running command server; shuts down its queue subscriptions within a
/// bounded grace period.
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.shutdown.send(true);
        for mut worker in self.workers.drain(..) {
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                worker.abort();
            }
        }
    }
}
