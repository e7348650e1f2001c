use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc::{self, UnboundedReceiver, UnboundedSender}};

use crate::message::{ChannelMessage, OutboundMessage};
use crate::transport::{ChannelTransport, TransportError};

/// In-memory transport for tests: inject inbound messages, inspect acks and replies.
#[derive(Clone)]
pub struct MockTransport {
    in_tx: Arc<Mutex<Option<UnboundedSender<ChannelMessage>>>>,
    in_rx: Arc<Mutex<UnboundedReceiver<ChannelMessage>>>,
    acked: Arc<Mutex<Vec<String>>>,
    outgoing: Arc<Mutex<Vec<OutboundMessage>>>,
    started: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        Self {
            in_tx: Arc::new(Mutex::new(Some(in_tx))),
            in_rx: Arc::new(Mutex::new(in_rx)),
            acked: Arc::new(Mutex::new(vec![])),
            outgoing: Arc::new(Mutex::new(vec![])),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue an inbound message.
    pub async fn inject(&self, msg: ChannelMessage) {
        if let Some(tx) = self.in_tx.lock().await.as_ref() {
            let _ = tx.send(msg);
        }
    }

    /// Close the inbound side; `next_inbound` returns `None` once drained.
    pub async fn close(&self) {
        self.in_tx.lock().await.take();
    }

    pub async fn acknowledged(&self) -> Vec<String> {
        self.acked.lock().await.clone()
    }

    pub async fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.outgoing.lock().await.clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn next_inbound(&self) -> Option<ChannelMessage> {
        self.in_rx.lock().await.recv().await
    }

    async fn acknowledge(&self, message_id: &str) -> Result<(), TransportError> {
        self.acked.lock().await.push(message_id.to_string());
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.outgoing.lock().await.push(message);
        Ok(())
    }

    async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }
}
