//! # Gemini Live Transport
//!
//! [`LiveTransport`] implementation over the Gemini Live bidirectional
//! WebSocket (`BidiGenerateContent`).
//!
//! ## Connection Lifecycle:
//! 1. **Handshake**: WebSocket upgrade with the API key as a query parameter
//! 2. **Setup**: the setup message is sent before anything else
//! 3. **Streaming**: a writer task drains queued audio chunks into the socket,
//!    a reader task turns inbound frames into [`TransportEvent`]s
//! 4. **Close**: `close()` queues a close frame and waits for the writer to send it
//!
//! The service sends its JSON in both text and binary frames; both are accepted.

use crate::audio::codec::EncodedChunk;
use crate::live::error::{ConnectError, TransportError};
use crate::live::protocol::{parse_server_message, ClientMessage, ServerEvent};
use crate::live::transport::{LiveSetup, LiveTransport, TransportConnection, TransportEvent, TransportHandle};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

/// How long `close()` waits for the writer to flush the close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connects live sessions to Gemini.
#[derive(Debug, Clone)]
pub struct GeminiLiveTransport {
    endpoint: String,
    api_key: String,
}

impl GeminiLiveTransport {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, separator, self.api_key)
    }
}

enum Outbound {
    Audio(EncodedChunk),
    Close(oneshot::Sender<()>),
}

struct GeminiHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl TransportHandle for GeminiHandle {
    fn send_audio(&self, chunk: EncodedChunk) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Audio(chunk))
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.outbound.send(Outbound::Close(done_tx)).is_err() {
            return;
        }
        if tokio::time::timeout(CLOSE_TIMEOUT, done_rx).await.is_err() {
            warn!("Timed out waiting for live socket to close");
        }
    }
}

#[async_trait]
impl LiveTransport for GeminiLiveTransport {
    async fn open(&self, setup: &LiveSetup) -> Result<TransportConnection, ConnectError> {
        if self.api_key.is_empty() {
            return Err(ConnectError::Handshake("no API key configured".to_string()));
        }

        let setup_json = ClientMessage::setup(setup).to_json()?;

        let (socket, response) = connect_async(self.url())
            .await
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;
        debug!(status = %response.status(), "Live socket upgraded");

        let (mut sink, mut stream) = socket.split();
        sink.send(Message::Text(setup_json))
            .await
            .map_err(|e| ConnectError::Handshake(format!("failed to send setup: {}", e)))?;

        info!(model = %setup.model, voice = %setup.voice_name, "Live session setup sent");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // Writer: queued audio and close requests → socket
        let writer_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Audio(chunk) => {
                        let json = match ClientMessage::audio(chunk).to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                error!("Failed to encode audio chunk: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            let _ = writer_events.send(TransportEvent::Error(TransportError::Socket(e.to_string())));
                            break;
                        }
                    }
                    Outbound::Close(done) => {
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            debug!("Close frame not sent: {}", e);
                        }
                        let _ = done.send(());
                        break;
                    }
                }
            }
            debug!("Live socket writer finished");
        });

        // Reader: socket → validated events
        tokio::spawn(async move {
            let mut reason = None;
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Ignoring non-UTF-8 binary frame from live socket");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        reason = frame.map(|f| f.reason.to_string());
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = event_tx.send(TransportEvent::Error(TransportError::Socket(e.to_string())));
                        return;
                    }
                };

                match parse_server_message(&text) {
                    Ok(events) => {
                        for event in events {
                            let event = match event {
                                ServerEvent::SetupComplete => TransportEvent::Open,
                                other => TransportEvent::Message(other),
                            };
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Skipping live frame: {}", e),
                }
            }
            let _ = event_tx.send(TransportEvent::Closed { reason });
        });

        Ok(TransportConnection {
            handle: Arc::new(GeminiHandle { outbound: outbound_tx }),
            events: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> LiveSetup {
        LiveSetup {
            model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice_name: "Zephyr".to_string(),
            system_instruction: "coach".to_string(),
        }
    }

    #[test]
    fn test_url_appends_key() {
        let transport = GeminiLiveTransport::new("wss://example.test/ws", "secret");
        assert_eq!(transport.url(), "wss://example.test/ws?key=secret");

        let transport = GeminiLiveTransport::new("wss://example.test/ws?alt=json", "secret");
        assert_eq!(transport.url(), "wss://example.test/ws?alt=json&key=secret");
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_before_dialing() {
        let transport = GeminiLiveTransport::new("wss://example.test/ws", "");
        assert!(matches!(
            transport.open(&setup()).await,
            Err(ConnectError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_handle_reports_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = GeminiHandle { outbound: tx };
        let chunk = EncodedChunk {
            data: String::new(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        };
        assert_eq!(handle.send_audio(chunk), Err(TransportError::ChannelClosed));
        // Closing a dead handle returns immediately
        handle.close().await;
    }
}
