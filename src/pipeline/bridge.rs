//! Thread boundary between the engine and the client.
//!
//! The engine pushes [`ClientEvent`]s through an unbounded crossbeam channel so
//! no engine thread ever blocks on a slow client. The client side drains
//! events through [`ClientBridge`].

use crate::hal::buffer::Buffer;
use crate::pipeline::frame::FrameMetadata;
use crate::pipeline::id::{FrameCount, RequestKey};
use crate::types::StreamKind;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Final status of a capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Complete,
    /// At least one requested buffer failed.
    PartialComplete,
    Aborted,
}

/// Messages sent from the engine to the client.
#[derive(Debug)]
pub enum ClientEvent {
    /// A filled stream buffer; the client now owns it.
    BufferComplete {
        key: RequestKey,
        stream: StreamKind,
        buffer: Buffer,
    },

    /// A requested stream buffer will not be delivered.
    BufferError { key: RequestKey, stream: StreamKind },

    /// Result metadata for one request.
    Metadata {
        key: RequestKey,
        frame: FrameCount,
        metadata: FrameMetadata,
    },

    /// The request is finished; sent in request order.
    RequestComplete {
        key: RequestKey,
        status: RequestStatus,
    },

    /// The device hit a fatal error. Sent at most once per session.
    DeviceError { reason: String },
}

impl ClientEvent {
    pub fn key(&self) -> Option<RequestKey> {
        match self {
            ClientEvent::BufferComplete { key, .. }
            | ClientEvent::BufferError { key, .. }
            | ClientEvent::Metadata { key, .. }
            | ClientEvent::RequestComplete { key, .. } => Some(*key),
            ClientEvent::DeviceError { .. } => None,
        }
    }
}

/// Engine-side event sender.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<ClientEvent>,
}

impl EventSender {
    pub fn send(&self, event: ClientEvent) {
        if let Err(e) = self.tx.send(event) {
            // Client went away; drop stream buffers with the event.
            tracing::trace!("Client bridge closed, dropping {:?}", e.into_inner().key());
        }
    }
}

/// Client-side receiver for engine events.
pub struct ClientBridge {
    rx: Receiver<ClientEvent>,
}

impl ClientBridge {
    /// Create the bridge and the engine-side sender.
    pub fn new() -> (Self, EventSender) {
        let (tx, rx) = unbounded();
        (Self { rx }, EventSender { tx })
    }

    /// Drain all pending events.
    pub fn drain(&self) -> impl Iterator<Item = ClientEvent> + '_ {
        self.rx.try_iter()
    }

    pub fn try_recv(&self) -> Option<ClientEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next event. `None` on timeout or when the engine is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ClientEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}
