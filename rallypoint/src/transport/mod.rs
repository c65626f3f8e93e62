pub mod connection;
pub(crate) mod listener;

pub use connection::{FrameReader, FrameWriter, Outbound, connect_with_retry, split_framed, spawn_writer};
pub use listener::TransportListener;
