//! A transport that runs the real channel connector as a child process and
//! exchanges newline-delimited JSON [`TransportFrame`]s over its stdin/stdout.
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::message::{ChannelMessage, OutboundMessage, TransportFrame};
use crate::transport::{ChannelTransport, TransportError};

pub struct ProcessTransport {
    name: String,
    command: String,
    args: Vec<String>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<ChannelMessage>>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    outbound: Mutex<Option<mpsc::Sender<TransportFrame>>>,
    child: Mutex<Option<Child>>,
}

impl ProcessTransport {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        let command = command.into();
        let name = std::path::Path::new(&command)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("channel")
            .to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            command,
            args,
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(rx),
            outbound: Mutex::new(None),
            child: Mutex::new(None),
        }
    }

    async fn write_frame(&self, frame: TransportFrame) -> Result<(), TransportError> {
        let guard = self.outbound.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(TransportError::NotStarted(self.name.clone()));
        };
        tx.send(frame)
            .await
            .map_err(|_| TransportError::Closed(self.name.clone()))
    }
}

#[async_trait]
impl ChannelTransport for ProcessTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), TransportError> {
        let Some(inbound_tx) = self.inbound_tx.lock().await.take() else {
            return Err(TransportError::Closed(self.name.clone()));
        };

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("{}: {e}", self.command)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("stdout unavailable".into()))?;

        // host → child
        let (frame_tx, mut frame_rx) = mpsc::channel::<TransportFrame>(32);
        let name = self.name.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let line = match serde_json::to_string(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(transport = %name, error = %e, "could not encode frame");
                        continue;
                    }
                };
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdin.write_all(b"\n").await;
                let _ = stdin.flush().await;
            }
        });

        // child → host
        let name = self.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TransportFrame>(&line) {
                    Ok(TransportFrame::Message { message }) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(TransportFrame::Log { level, text }) => match level.as_str() {
                        "error" => error!(transport = %name, "{text}"),
                        "warn" => warn!(transport = %name, "{text}"),
                        "debug" | "trace" => debug!(transport = %name, "{text}"),
                        _ => info!(transport = %name, "{text}"),
                    },
                    Ok(other) => warn!(transport = %name, ?other, "unexpected frame from transport"),
                    Err(e) => warn!(transport = %name, error = %e, "ignoring malformed line"),
                }
            }
            info!(transport = %name, "transport output closed");
        });

        *self.outbound.lock().await = Some(frame_tx);
        *self.child.lock().await = Some(child);
        info!(transport = %self.name, command = %self.command, "channel transport started");
        Ok(())
    }

    async fn next_inbound(&self) -> Option<ChannelMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn acknowledge(&self, message_id: &str) -> Result<(), TransportError> {
        self.write_frame(TransportFrame::Ack { id: message_id.to_string() }).await
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.write_frame(TransportFrame::Send { message }).await
    }

    async fn stop(&self) {
        let _ = self.write_frame(TransportFrame::Stop).await;
        self.outbound.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(transport = %self.name, error = %e, "transport already exited");
            }
        }
    }
}
