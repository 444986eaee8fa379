//! NATS-backed realtime transport.
//!
//! Subjects, per tenant:
//!   offsync.{tenant}.push    server → devices (remote mutations, notices, keep-alives)
//!   offsync.{tenant}.client  devices → server (hello, keep-alive acks)
//!
//! Requires feature `nats` (async-nats optional dep).

#[cfg(feature = "nats")]
pub use inner::*;

#[cfg(feature = "nats")]
mod inner {
    use std::sync::Arc;

    use async_nats::{ConnectErrorKind, Event};
    use async_trait::async_trait;
    use futures::StreamExt;
    use offsync_core::{ClientInfo, OfsResult, SyncError};
    use secrecy::ExposeSecret;
    use tracing::{debug, info, warn};

    use crate::protocol::ChannelMessage;
    use crate::realtime::{Connection, Credentials, MessageSink, RealtimeTransport};

    // ── Subjects ──────────────────────────────────────────────────────────────

    pub fn push_subject(tenant: &str) -> String {
        format!("offsync.{tenant}.push")
    }

    pub fn client_subject(tenant: &str) -> String {
        format!("offsync.{tenant}.client")
    }

    // ── NatsTransport ─────────────────────────────────────────────────────────

    /// Dials NATS with token auth. Reconnection is left to
    /// [`RealtimeChannel`](crate::realtime::RealtimeChannel): a client-level
    /// disconnect ends the inbound stream.
    pub struct NatsTransport {
        client_info: ClientInfo,
    }

    impl NatsTransport {
        pub fn new(client_info: ClientInfo) -> Self {
            Self { client_info }
        }
    }

    #[async_trait]
    impl RealtimeTransport for NatsTransport {
        async fn connect(
            &self,
            endpoint: &str,
            credentials: &Credentials,
            hello: &ChannelMessage,
        ) -> OfsResult<Connection> {
            let (drop_tx, drop_rx) = futures::channel::mpsc::unbounded::<OfsResult<ChannelMessage>>();

            let options = async_nats::ConnectOptions::with_token(
                credentials.token.expose_secret().to_string(),
            )
            .name(format!("offsync-{}", self.client_info.device_id))
            // RealtimeChannel owns the reconnect schedule; the initial dial
            // counts against this limit
            .max_reconnects(1)
            .event_callback(move |event| {
                let drop_tx = drop_tx.clone();
                async move {
                    match event {
                        Event::Disconnected => {
                            let _ = drop_tx.unbounded_send(Err(SyncError::Network(
                                "NATS connection lost".into(),
                            )));
                        }
                        Event::ServerError(async_nats::ServerError::AuthorizationViolation) => {
                            let _ = drop_tx.unbounded_send(Err(SyncError::Auth(
                                "NATS authorization violation".into(),
                            )));
                        }
                        other => debug!("NATS event: {other}"),
                    }
                }
            });

            let client = options.connect(endpoint).await.map_err(|e| match e.kind() {
                ConnectErrorKind::AuthorizationViolation | ConnectErrorKind::Authentication => {
                    SyncError::Auth(format!("NATS rejected credentials at {endpoint}: {e}"))
                }
                _ => SyncError::Network(format!("connecting to NATS at {endpoint}: {e}")),
            })?;
            info!("NATS: connected to {endpoint}");

            let tenant = credentials.tenant_id.as_str();
            let subscriber = client
                .subscribe(push_subject(tenant))
                .await
                .map_err(|e| SyncError::Network(format!("subscribing to {}: {e}", push_subject(tenant))))?;

            let sink = Arc::new(NatsSink {
                client,
                subject: client_subject(tenant),
            });
            sink.send(hello).await?;

            let messages = subscriber.filter_map(|msg| {
                futures::future::ready(match ChannelMessage::from_bytes(&msg.payload) {
                    Ok(message) => Some(Ok(message)),
                    Err(e) => {
                        warn!(subject = %msg.subject, "skipping malformed channel message: {e}");
                        None
                    }
                })
            });
            let inbound = futures::stream::select(messages, drop_rx).boxed();

            Ok(Connection { sink, inbound })
        }
    }

    // ── NatsSink ──────────────────────────────────────────────────────────────

    struct NatsSink {
        client: async_nats::Client,
        subject: String,
    }

    #[async_trait]
    impl MessageSink for NatsSink {
        async fn send(&self, message: &ChannelMessage) -> OfsResult<()> {
            let payload = bytes::Bytes::from(message.to_bytes()?);
            self.client
                .publish(self.subject.clone(), payload)
                .await
                .map_err(|e| SyncError::Network(format!("publishing {}: {e}", message.type_name())))?;
            debug!(kind = message.type_name(), subject = %self.subject, "published");
            Ok(())
        }

        async fn close(&self) {
            if let Err(e) = self.client.flush().await {
                warn!("NATS flush on close failed: {e}");
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn subjects_are_tenant_scoped() {
            assert_eq!(push_subject("acme"), "offsync.acme.push");
            assert_eq!(client_subject("acme"), "offsync.acme.client");
        }
    }
}
