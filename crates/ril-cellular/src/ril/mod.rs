//! Radio interface layer: request tokens, typed payloads and the transport.

pub mod token;
pub mod transport;
pub mod types;

pub use token::{Completion, CompletionFn, ResponseSlot, Token, TokenId};
pub use transport::{
    send_and_wait, RadioInterface, RadioTransport, RilEnv, Transport, UnsolicitedHandler,
};
pub use types::*;
