//! Core identifier and enum types shared across the protocol

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Stream identifier: high 32 bits are the owning client id, low 32 bits a
/// per-client stream counter. Unique for the lifetime of the server.
pub type StreamId = u64;

/// Node identifier: high 32 bits are the device index, low 32 bits the node
/// index within that device. `0` means "no node".
pub type NodeId = u64;

/// Device index value meaning "not pinned to any device".
pub const NO_DEVICE: u32 = 0;

/// Maximum length of a hotword model name on the wire, including padding.
pub const HOTWORD_MODEL_NAME_MAX: usize = 8;

/// Builds a stream id from a client id and a per-client stream counter.
pub fn stream_id(client_id: u32, stream_index: u32) -> StreamId {
    ((client_id as u64) << 32) | stream_index as u64
}

/// Client id part of a stream id.
pub fn stream_id_client(id: StreamId) -> u32 {
    (id >> 32) as u32
}

/// Builds a node id from a device index and node index.
pub fn node_id(dev_index: u32, node_index: u32) -> NodeId {
    ((dev_index as u64) << 32) | node_index as u64
}

/// Device index part of a node id.
pub fn node_id_dev_index(id: NodeId) -> u32 {
    (id >> 32) as u32
}

/// Node index part of a node id.
pub fn node_id_node_index(id: NodeId) -> u32 {
    (id & 0xffff_ffff) as u32
}

/// Direction of an audio stream or device.
///
/// The loopback directions are stream-side views of the two output taps;
/// devices themselves are only ever `Output` or `Input`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Direction {
    Output = 0,
    Input = 1,
    PostMixPreDsp = 2,
    PostDsp = 3,
}

/// Number of device-side directions (output, input).
pub const NUM_HW_DIRECTIONS: usize = 2;

impl Direction {
    pub fn from_u32(v: u32) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(Direction::Output),
            1 => Ok(Direction::Input),
            2 => Ok(Direction::PostMixPreDsp),
            3 => Ok(Direction::PostDsp),
            _ => Err(ProtoError::BadEnumValue {
                what: "Direction",
                value: v,
            }),
        }
    }

    /// True if streams of this direction consume from output hardware.
    pub fn uses_output_hw(self) -> bool {
        self == Direction::Output
    }

    /// True if streams of this direction produce from input hardware,
    /// including the loopback taps which capture the output path.
    pub fn uses_input_hw(self) -> bool {
        !self.uses_output_hw()
    }

    /// The hardware direction servicing a stream of this direction.
    pub fn hw_direction(self) -> Direction {
        if self.uses_output_hw() {
            Direction::Output
        } else {
            Direction::Input
        }
    }

    /// Index usable for the per-direction device tables.
    pub fn hw_index(self) -> usize {
        self.hw_direction() as usize
    }
}

/// Client-declared usage class of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum StreamType {
    Default = 0,
    Multimedia = 1,
    VoiceCommunication = 2,
    SpeechRecognition = 3,
    ProAudio = 4,
}

impl StreamType {
    pub fn from_u32(v: u32) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(StreamType::Default),
            1 => Ok(StreamType::Multimedia),
            2 => Ok(StreamType::VoiceCommunication),
            3 => Ok(StreamType::SpeechRecognition),
            4 => Ok(StreamType::ProAudio),
            _ => Err(ProtoError::BadEnumValue {
                what: "StreamType",
                value: v,
            }),
        }
    }
}

/// Bit flags carried in the stream connect message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFlags(pub u32);

impl StreamFlags {
    /// Client can accept more than cb_threshold frames per fetch.
    pub const BULK_AUDIO_OK: u32 = 0x01;
    /// Stream feeds a hotword recognizer; serviced only on trigger.
    pub const HOTWORD_STREAM: u32 = 0x02;
    /// Don't stream data, only wake the client on trigger.
    pub const TRIGGER_ONLY: u32 = 0x04;

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

/// What kind of endpoint a node is, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum NodeType {
    Unknown = 0,
    InternalSpeaker = 1,
    Headphone = 2,
    Hdmi = 3,
    Haptic = 4,
    Mic = 5,
    Hotword = 6,
    Lineout = 7,
    PostMixPreDsp = 8,
    PostDsp = 9,
    Usb = 10,
    Bluetooth = 11,
}

impl NodeType {
    pub fn as_str(self, position: NodePosition) -> &'static str {
        match self {
            NodeType::InternalSpeaker => "INTERNAL_SPEAKER",
            NodeType::Headphone => "HEADPHONE",
            NodeType::Hdmi => "HDMI",
            NodeType::Haptic => "HAPTIC",
            NodeType::Mic => match position {
                NodePosition::Internal => "INTERNAL_MIC",
                NodePosition::Front => "FRONT_MIC",
                NodePosition::Rear => "REAR_MIC",
                NodePosition::Keyboard => "KEYBOARD_MIC",
                NodePosition::External => "MIC",
            },
            NodeType::Hotword => "HOTWORD",
            NodeType::Lineout => "LINEOUT",
            NodeType::PostMixPreDsp => "POST_MIX_LOOPBACK",
            NodeType::PostDsp => "POST_DSP_LOOPBACK",
            NodeType::Usb => "USB",
            NodeType::Bluetooth => "BLUETOOTH",
            NodeType::Unknown => "UNKNOWN",
        }
    }
}

/// Physical placement of a node on the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum NodePosition {
    External = 0,
    Internal = 1,
    Front = 2,
    Rear = 3,
    Keyboard = 4,
}

/// Mutable node attributes addressable from the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NodeAttr {
    Plugged = 0,
    Volume = 1,
    CaptureGain = 2,
    SwapLeftRight = 3,
}

impl NodeAttr {
    pub fn from_u32(v: u32) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(NodeAttr::Plugged),
            1 => Ok(NodeAttr::Volume),
            2 => Ok(NodeAttr::CaptureGain),
            3 => Ok(NodeAttr::SwapLeftRight),
            _ => Err(ProtoError::BadEnumValue {
                what: "NodeAttr",
                value: v,
            }),
        }
    }
}

/// Kinds of test device a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TestDevType {
    Hotword = 0,
}

impl TestDevType {
    pub fn from_u32(v: u32) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(TestDevType::Hotword),
            _ => Err(ProtoError::BadEnumValue {
                what: "TestDevType",
                value: v,
            }),
        }
    }
}

/// Commands addressed to a test device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TestDevCommand {
    HotwordTrigger = 0,
    FeedSamples = 1,
}

impl TestDevCommand {
    pub fn from_u32(v: u32) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(TestDevCommand::HotwordTrigger),
            1 => Ok(TestDevCommand::FeedSamples),
            _ => Err(ProtoError::BadEnumValue {
                what: "TestDevCommand",
                value: v,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_packing() {
        let id = stream_id(7, 42);
        assert_eq!(stream_id_client(id), 7);
        assert_eq!(id & 0xffff_ffff, 42);
    }

    #[test]
    fn test_node_id_packing() {
        let id = node_id(3, 1);
        assert_eq!(node_id_dev_index(id), 3);
        assert_eq!(node_id_node_index(id), 1);
        assert_eq!(node_id(0, 0), 0, "zero node id is the no-node sentinel");
    }

    #[test]
    fn test_direction_hw_mapping() {
        assert!(Direction::Output.uses_output_hw());
        assert!(Direction::Input.uses_input_hw());
        assert!(Direction::PostMixPreDsp.uses_input_hw());
        assert_eq!(Direction::PostDsp.hw_direction(), Direction::Input);
        assert_eq!(Direction::Output.hw_index(), 0);
        assert_eq!(Direction::PostMixPreDsp.hw_index(), 1);
    }

    #[test]
    fn test_direction_rejects_unknown() {
        assert!(Direction::from_u32(9).is_err());
    }

    #[test]
    fn test_stream_flags() {
        let flags = StreamFlags(StreamFlags::BULK_AUDIO_OK | StreamFlags::TRIGGER_ONLY);
        assert!(flags.contains(StreamFlags::BULK_AUDIO_OK));
        assert!(flags.contains(StreamFlags::TRIGGER_ONLY));
        assert!(!flags.contains(StreamFlags::HOTWORD_STREAM));
    }

    #[test]
    fn test_mic_position_names() {
        assert_eq!(NodeType::Mic.as_str(NodePosition::Internal), "INTERNAL_MIC");
        assert_eq!(NodeType::Mic.as_str(NodePosition::External), "MIC");
        assert_eq!(
            NodeType::Headphone.as_str(NodePosition::External),
            "HEADPHONE"
        );
    }
}
