//! Client-side stream writing. The writer is an explicit state machine:
//! once a byte has been committed (`Streaming`), failures must be emitted as
//! in-stream content, never as a status change.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use antigate_transform::{ClaudeStreamEncoder, OpenAiStreamEncoder, UpstreamEvent};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SinkState {
    Fresh,
    Streaming,
    Closed,
}

pub(crate) struct SseWriter {
    tx: mpsc::Sender<Bytes>,
    state: SinkState,
}

impl SseWriter {
    pub(crate) fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            state: SinkState::Fresh,
        }
    }

    pub(crate) fn committed(&self) -> bool {
        self.state != SinkState::Fresh
    }

    pub(crate) async fn data<T: Serialize>(&mut self, payload: &T) -> bool {
        match serde_json::to_string(payload) {
            Ok(json) => self.raw(format!("data: {json}\n\n")).await,
            Err(_) => true,
        }
    }

    pub(crate) async fn named<T: Serialize>(&mut self, name: &str, payload: &T) -> bool {
        match serde_json::to_string(payload) {
            Ok(json) => self.raw(format!("event: {name}\ndata: {json}\n\n")).await,
            Err(_) => true,
        }
    }

    pub(crate) async fn done(&mut self) -> bool {
        let sent = self.raw("data: [DONE]\n\n".to_string()).await;
        self.state = SinkState::Closed;
        sent
    }

    async fn raw(&mut self, frame: String) -> bool {
        if self.state == SinkState::Closed {
            return false;
        }
        match self.tx.send(Bytes::from(frame)).await {
            Ok(()) => {
                self.state = SinkState::Streaming;
                true
            }
            Err(_) => {
                self.state = SinkState::Closed;
                false
            }
        }
    }
}

/// One dialect's streaming emission. Return value is "client still
/// connected"; a false stops the pump without touching the credential.
#[async_trait]
pub(crate) trait StreamSink: Send {
    async fn start(&mut self, writer: &mut SseWriter) -> bool;
    async fn on_event(&mut self, writer: &mut SseWriter, event: &UpstreamEvent) -> bool;
    async fn finish(&mut self, writer: &mut SseWriter) -> bool;
    async fn error(&mut self, writer: &mut SseWriter, message: &str) -> bool;
}

pub(crate) struct OpenAiSink {
    encoder: OpenAiStreamEncoder,
}

impl OpenAiSink {
    pub(crate) fn new(model: &str) -> Self {
        Self {
            encoder: OpenAiStreamEncoder::new(model),
        }
    }
}

#[async_trait]
impl StreamSink for OpenAiSink {
    async fn start(&mut self, _writer: &mut SseWriter) -> bool {
        true
    }

    async fn on_event(&mut self, writer: &mut SseWriter, event: &UpstreamEvent) -> bool {
        for chunk in self.encoder.on_event(event) {
            if !writer.data(&chunk).await {
                return false;
            }
        }
        true
    }

    async fn finish(&mut self, writer: &mut SseWriter) -> bool {
        let chunk = self.encoder.finish();
        if !writer.data(&chunk).await {
            return false;
        }
        writer.done().await
    }

    async fn error(&mut self, writer: &mut SseWriter, message: &str) -> bool {
        let event = UpstreamEvent::Text(format!("错误: {message}"));
        if !self.on_event(writer, &event).await {
            return false;
        }
        self.finish(writer).await
    }
}

pub(crate) struct ClaudeSink {
    encoder: ClaudeStreamEncoder,
}

impl ClaudeSink {
    pub(crate) fn new(model: &str, input_estimate: i64) -> Self {
        Self {
            encoder: ClaudeStreamEncoder::new(model, input_estimate),
        }
    }

    async fn write_events(
        writer: &mut SseWriter,
        events: Vec<antigate_protocol::claude::StreamEvent>,
    ) -> bool {
        for event in events {
            if !writer.named(event.name(), &event).await {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl StreamSink for ClaudeSink {
    async fn start(&mut self, writer: &mut SseWriter) -> bool {
        Self::write_events(writer, self.encoder.start()).await
    }

    async fn on_event(&mut self, writer: &mut SseWriter, event: &UpstreamEvent) -> bool {
        Self::write_events(writer, self.encoder.on_event(event)).await
    }

    async fn finish(&mut self, writer: &mut SseWriter) -> bool {
        Self::write_events(writer, self.encoder.finish()).await
    }

    async fn error(&mut self, writer: &mut SseWriter, message: &str) -> bool {
        let event = UpstreamEvent::Text(format!("错误: {message}"));
        if !self.on_event(writer, &event).await {
            return false;
        }
        self.finish(writer).await
    }
}
