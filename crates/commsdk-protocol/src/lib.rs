//! Wire vocabulary shared by the session core and its transports.

pub mod codec;
pub mod error;
pub mod media;
pub mod messages;
pub mod types;

pub use error::ProtocolError;
