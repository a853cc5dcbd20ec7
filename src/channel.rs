//! Binary method channel.
//!
//! Outbound: [`MethodChannel::call`] encodes a [`ClientCall`] and hands the
//! frame to the attached [`Transport`]. With no open transport the call is
//! a silent no-op returning `false`; callers must not assume delivery.
//!
//! Inbound: [`MethodChannel::receive`] decodes one frame at a time, in the
//! order the host feeds them. Unknown opcodes and malformed payloads are
//! logged and dropped; they never escape as errors.

use crate::error::{ProtocolError, TransportError};
use crate::protocol::{self, ClientCall, ServerMessage};
use bytes::Bytes;
use log::{debug, warn};
use std::time::Instant;

/// Frame sink for an open connection.
pub trait Transport: Send {
    fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;
    fn is_open(&self) -> bool;
    fn close(&mut self);
}

/// Receives decoded inbound messages in arrival order.
pub trait ServerHandler {
    fn handle(&mut self, message: ServerMessage, now: Instant);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
}

pub struct MethodChannel {
    transport: Option<Box<dyn Transport>>,
    stats: ChannelStats,
}

impl std::fmt::Debug for MethodChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodChannel")
            .field("connected", &self.is_connected())
            .field("stats", &self.stats)
            .finish()
    }
}

impl MethodChannel {
    /// Build a channel after checking the method schema tables.
    pub fn new() -> Result<Self, ProtocolError> {
        protocol::validate_schema()?;
        Ok(Self {
            transport: None,
            stats: ChannelStats::default(),
        })
    }

    pub fn attach(&mut self, transport: Box<dyn Transport>) {
        if let Some(mut old) = self.transport.replace(transport) {
            old.close();
        }
    }

    /// Close and drop the transport.
    pub fn detach(&mut self) {
        if let Some(mut t) = self.transport.take() {
            t.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_open())
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Send one call. Returns whether the frame reached the transport.
    pub fn call(&mut self, call: &ClientCall) -> bool {
        let Some(transport) = self.transport.as_mut().filter(|t| t.is_open()) else {
            debug!("Dropping {} call, not connected", protocol::outbound_name(call.op()));
            return false;
        };
        match transport.send(call.encode()) {
            Ok(()) => {
                self.stats.sent += 1;
                true
            }
            Err(e) => {
                warn!("Failed to send {}: {}", protocol::outbound_name(call.op()), e);
                false
            }
        }
    }

    /// Decode one inbound frame, or log and drop it.
    pub fn receive(&mut self, frame: &[u8]) -> Option<ServerMessage> {
        match ServerMessage::decode(frame) {
            Ok(message) => {
                self.stats.received += 1;
                debug!("<- {}", protocol::inbound_name(message.op()));
                Some(message)
            }
            Err(e) => {
                self.stats.dropped += 1;
                warn!("Dropping inbound frame ({} bytes): {}", frame.len(), e);
                None
            }
        }
    }

    /// Decode and hand one frame to `handler`. Returns whether it was handled.
    pub fn dispatch(&mut self, frame: &[u8], handler: &mut impl ServerHandler, now: Instant) -> bool {
        match self.receive(frame) {
            Some(message) => {
                handler.handle(message, now);
                true
            }
            None => false,
        }
    }
}
