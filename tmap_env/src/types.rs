//! Common types for the T-MAP environment abstraction.

use serde::{Deserialize, Serialize};

/// One inbound datagram as handed to the engine.
///
/// This is a transport-layer wrapper - the payload is opaque bytes that the
/// wire codec decodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datagram {
    /// The raw payload bytes
    pub payload: Vec<u8>,

    /// Sender address, when the transport knows it
    pub source: Option<String>,
}

impl Datagram {
    /// Creates a datagram from payload bytes with no known sender.
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            source: None,
        }
    }

    /// Attaches the sender label.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
