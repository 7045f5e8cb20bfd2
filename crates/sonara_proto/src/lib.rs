//! Sonara wire protocol
//!
//! Everything a client needs to talk to the server: the control message
//! catalog with its packed little-endian framing, the audio format
//! description, stream/node id packing, and the tiny fixed-size message
//! exchanged over each stream's audio socket.
//!
//! Control messages travel over a `SOCK_SEQPACKET` Unix socket, one message
//! per datagram, each starting with a `{ u32 length, u32 id }` header.
//! Payloads are capped at [`MAX_MSG_SIZE`] unless the message carries a
//! variable-length tail.

mod error;
mod format;
mod messages;
mod types;

pub use error::ProtoError;
pub use format::{
    Format, PackedFormat, SampleFormat, CH_MAX, PACKED_FORMAT_SIZE,
};
pub use messages::{
    AudioMessage, AudioMsgId, ClientMessage, ServerMessage, HEADER_SIZE,
    MAX_MSG_SIZE,
};
pub use types::{
    node_id, node_id_dev_index, node_id_node_index, stream_id,
    stream_id_client, Direction, NodeAttr, NodeId, NodePosition, NodeType,
    StreamFlags, StreamId, StreamType, TestDevCommand, TestDevType,
    HOTWORD_MODEL_NAME_MAX, NO_DEVICE, NUM_HW_DIRECTIONS,
};

/// Protocol revision; bumped when message layout or id values change.
pub const PROTO_VERSION: u32 = 1;
