//! Opcode handler registry.
//!
//! Application logic registers one handler per opcode before the listener
//! starts; the registry is then moved into the driver behind an `Arc` and
//! never mutated again. Handlers borrow the connection and packet for the
//! duration of one dispatch and return an action; they never retain either.

use std::collections::HashMap;

use bytes::Bytes;
use packline_core::Connection;
use packline_proto::Packet;

use crate::error::ServerError;

/// What a handler wants done after processing a packet.
#[derive(Debug)]
pub enum HandlerAction {
    /// Send this packet back on the same connection
    Reply(Packet),
    /// Nothing to send
    NoReply,
    /// Close the connection with a reason
    Close(String),
}

/// A handler failed while processing a packet.
///
/// Handler failures are reported and the connection stays Open; only an
/// explicit [`HandlerAction::Close`] tears it down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(pub String);

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler error: {}", self.0)
    }
}

impl std::error::Error for HandlerError {}

/// Borrowed view a handler receives for one dispatch.
///
/// `payload` is the plaintext payload: the connection cipher has already
/// been applied when the ENCRYPTED flag was set, while `packet.payload`
/// stays as received on the wire.
pub struct HandlerContext<'a> {
    /// The connection the packet arrived on
    pub connection: &'a Connection,
    /// The decoded packet
    pub packet: &'a Packet,
    /// Plaintext payload bytes
    pub payload: &'a Bytes,
    /// Wall-clock Unix milliseconds at dispatch
    pub now_ms: i64,
}

/// A registered packet handler.
pub type PacketHandler =
    dyn Fn(&HandlerContext<'_>) -> Result<HandlerAction, HandlerError> + Send + Sync;

/// Registry mapping opcodes to handlers.
///
/// Built mutably at startup, then frozen by moving it into the driver. At
/// most one handler per opcode.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<u16, Box<PacketHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an opcode.
    ///
    /// # Errors
    ///
    /// - [`ServerError::DuplicateHandler`] if the opcode already has one.
    pub fn register(
        &mut self,
        opcode: u16,
        handler: impl Fn(&HandlerContext<'_>) -> Result<HandlerAction, HandlerError>
        + Send
        + Sync
        + 'static,
    ) -> Result<(), ServerError> {
        match self.handlers.entry(opcode) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(ServerError::DuplicateHandler(opcode))
            },
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(Box::new(handler));
                Ok(())
            },
        }
    }

    /// Look up the handler for an opcode.
    #[must_use]
    pub fn get(&self, opcode: u16) -> Option<&PacketHandler> {
        self.handlers.get(&opcode).map(Box::as_ref)
    }

    /// Number of registered opcodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opcodes: Vec<u16> = self.handlers.keys().copied().collect();
        opcodes.sort_unstable();
        f.debug_struct("HandlerRegistry").field("opcodes", &opcodes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register(0x0001, |_ctx| Ok(HandlerAction::NoReply)).unwrap();

        assert!(registry.get(0x0001).is_some());
        assert!(registry.get(0x0002).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = HandlerRegistry::new();
        registry.register(0x0001, |_ctx| Ok(HandlerAction::NoReply)).unwrap();

        let result = registry.register(0x0001, |_ctx| Ok(HandlerAction::NoReply));
        assert!(matches!(result, Err(ServerError::DuplicateHandler(0x0001))));
        assert_eq!(registry.len(), 1);
    }
}
