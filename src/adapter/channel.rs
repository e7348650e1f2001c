// src/adapter/channel.rs
use std::sync::Arc;

use async_trait::async_trait;
use channel_api::{ChannelMessage, ChannelTransport};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchOutcome, Dispatcher, FanOutReport};
use crate::envelope::{AckSink, Acknowledger, Envelope};
use crate::signature::Signer;

/// Sends acknowledgements back through the transport the message came from.
pub struct TransportAck {
    transport: Arc<dyn ChannelTransport>,
}

impl TransportAck {
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl AckSink for TransportAck {
    async fn acknowledge(&self, message_id: &str) -> anyhow::Result<()> {
        Ok(self.transport.acknowledge(message_id).await?)
    }
}

/// Pulls inbound messages off a transport and fans them out as MESSAGE envelopes.
pub struct ChannelPump {
    transport: Arc<dyn ChannelTransport>,
    dispatcher: Arc<Dispatcher>,
    signer: Signer,
}

impl ChannelPump {
    pub fn new(transport: Arc<dyn ChannelTransport>, dispatcher: Arc<Dispatcher>, signer: Signer) -> Self {
        Self { transport, dispatcher, signer }
    }

    /// Runs until the transport closes or `cancel` fires, then stops the transport.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.transport.start().await?;
        info!(channel = self.transport.name(), "channel pump started");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.transport.next_inbound() => next,
            };
            let Some(message) = next else {
                info!(channel = self.transport.name(), "transport closed");
                break;
            };
            self.handle(message).await;
        }
        self.transport.stop().await;
        Ok(())
    }

    /// Dispatch one message, forward replies, and acknowledge it if no handler did.
    pub async fn handle(&self, message: ChannelMessage) -> FanOutReport {
        let ack = Acknowledger::new(message.id.clone(), Arc::new(TransportAck::new(self.transport.clone())));
        let envelope = Envelope::from_message(message.clone(), ack.clone(), &self.signer);
        let context = envelope.context.clone();

        let report = match self.dispatcher.dispatch(envelope).await {
            DispatchOutcome::FanOut(report) => report,
            _ => FanOutReport::default(),
        };
        for reply in context.take_replies() {
            if let Err(e) = self.transport.send(message.reply(reply.body)).await {
                warn!(message = %message.id, error = %e, "failed to send reply");
            }
        }
        if !ack.is_acknowledged() {
            if let Err(e) = ack.acknowledge().await {
                warn!(message = %message.id, error = %e, "failed to acknowledge message");
            }
        }
        debug!(
            message = %message.id,
            tag = %message.message_type,
            matched = report.matched,
            failed = report.failures.len(),
            "message handled"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Listener, handler_fn, new_gate, predicate_fn};
    use crate::envelope::EventKind;
    use crate::provenance::Provenance;
    use channel_api::mock::MockTransport;
    use serde_json::json;

    fn listen(dispatcher: &Dispatcher, tag: &'static str, reply: Option<&'static str>, ack: bool) {
        dispatcher.register(Listener {
            kind: EventKind::Message,
            predicate: predicate_fn(move |e| e.payload.as_message().is_some_and(|m| m.message_type == tag)),
            handler: handler_fn(move |e| async move {
                if let Some(text) = reply {
                    e.context.respond(json!({ "text": text }));
                }
                if ack {
                    e.context.acknowledge().await?;
                }
                Ok(json!(null))
            }),
            provenance: Provenance::Core,
            gate: new_gate(),
            label: format!("message {tag}"),
        });
    }

    #[tokio::test]
    async fn replies_are_sent_and_messages_acked_once() {
        let mock = Arc::new(MockTransport::new());
        let dispatcher = Arc::new(Dispatcher::new());
        listen(&dispatcher, "ping", Some("pong"), true);
        listen(&dispatcher, "ping", None, true);
        let pump = ChannelPump::new(mock.clone(), dispatcher, Signer::new("k"));

        let message = ChannelMessage::new("room", "ping", json!({}));
        let report = pump.handle(message.clone()).await;
        assert_eq!(report.matched, 2);
        assert_eq!(mock.acknowledged().await, vec![message.id.clone()]);
        let sent = mock.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, json!({ "text": "pong" }));
        assert_eq!(sent[0].in_reply_to.as_deref(), Some(message.id.as_str()));
    }

    #[tokio::test]
    async fn unhandled_messages_are_acked_automatically() {
        let mock = Arc::new(MockTransport::new());
        let pump = ChannelPump::new(mock.clone(), Arc::new(Dispatcher::new()), Signer::new("k"));
        let message = ChannelMessage::new("room", "unknown", json!({}));
        assert_eq!(pump.handle(message.clone()).await.matched, 0);
        assert_eq!(mock.acknowledged().await, vec![message.id]);
    }

    #[tokio::test]
    async fn run_drains_until_the_transport_closes() {
        let mock = Arc::new(MockTransport::new());
        let dispatcher = Arc::new(Dispatcher::new());
        listen(&dispatcher, "ping", Some("pong"), false);
        let pump = ChannelPump::new(mock.clone(), dispatcher, Signer::new("k"));

        mock.inject(ChannelMessage::new("room", "ping", json!({}))).await;
        mock.inject(ChannelMessage::new("room", "ping", json!({}))).await;
        mock.close().await;
        pump.run(CancellationToken::new()).await.unwrap();

        assert_eq!(mock.sent_messages().await.len(), 2);
        assert_eq!(mock.acknowledged().await.len(), 2);
        assert!(!mock.is_started());
    }
}
