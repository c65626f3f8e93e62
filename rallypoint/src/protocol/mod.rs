pub mod codec;
pub mod header;
pub mod message;

pub use codec::RallyCodec;
pub use message::RallyMessage;
