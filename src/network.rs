//! Trait for pluggable peer-to-peer (P2P) networking.
//!
//! Main trait: [`Network`].

use ed25519_dalek::VerifyingKey;

use crate::messages::Message;

/// Trait for pluggable peer-to-peer (P2P) networking.
///
/// The service addresses peers by their Ed25519 verifying key. Delivery is best-effort:
/// `send` must not block, and a lost message surfaces as a deadline expiry in the waiting
/// sub-protocol, never as an error here.
pub trait Network: Clone + Send + 'static {
    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: VerifyingKey, message: Message);

    /// Receive a message from any peer. Returns immediately with a None if no message is
    /// available now.
    fn recv(&mut self) -> Option<(VerifyingKey, Message)>;
}
