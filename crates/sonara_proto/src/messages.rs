//! Control-plane and audio-socket message catalog
//!
//! Every control message is one seqpacket datagram starting with
//! `{ u32 length, u32 id }` in little-endian, `length` covering the whole
//! datagram. Ids are stable; id 2 on the server side is reserved from an
//! earlier revision and never reused.

use crate::error::ProtoError;
use crate::format::Format;
use crate::types::{
    Direction, NodeAttr, NodeId, StreamId, StreamType, TestDevCommand,
    TestDevType, HOTWORD_MODEL_NAME_MAX,
};

/// Bytes of the `{ length, id }` header.
pub const HEADER_SIZE: usize = 8;

/// Cap for fixed-size messages in either direction. Messages carrying a
/// variable tail (`TestDevCommand`, `ConfigGlobalRemix`,
/// `GetHotwordModelsReady`) may exceed it.
pub const MAX_MSG_SIZE: usize = 256;

// Client -> server ids. Id 2 is reserved.
const SERVER_CONNECT_STREAM: u32 = 0;
const SERVER_DISCONNECT_STREAM: u32 = 1;
const SERVER_SET_SYSTEM_VOLUME: u32 = 3;
const SERVER_SET_SYSTEM_MUTE: u32 = 4;
const SERVER_SET_USER_MUTE: u32 = 5;
const SERVER_SET_SYSTEM_MUTE_LOCKED: u32 = 6;
const SERVER_SET_SYSTEM_CAPTURE_GAIN: u32 = 7;
const SERVER_SET_SYSTEM_CAPTURE_MUTE: u32 = 8;
const SERVER_SET_SYSTEM_CAPTURE_MUTE_LOCKED: u32 = 9;
const SERVER_SET_NODE_ATTR: u32 = 10;
const SERVER_SELECT_NODE: u32 = 11;
const SERVER_RELOAD_DSP: u32 = 12;
const SERVER_DUMP_DSP_INFO: u32 = 13;
const SERVER_DUMP_AUDIO_THREAD: u32 = 14;
const SERVER_ADD_ACTIVE_NODE: u32 = 15;
const SERVER_RM_ACTIVE_NODE: u32 = 16;
const SERVER_ADD_TEST_DEV: u32 = 17;
const SERVER_TEST_DEV_COMMAND: u32 = 18;
const SERVER_SUSPEND: u32 = 19;
const SERVER_RESUME: u32 = 20;
const SERVER_CONFIG_GLOBAL_REMIX: u32 = 21;
const SERVER_GET_HOTWORD_MODELS: u32 = 22;
const SERVER_SET_HOTWORD_MODEL: u32 = 23;
const SERVER_REGISTER_NOTIFICATION: u32 = 24;

// Server -> client ids. Ids from CLIENT_OUTPUT_VOLUME_CHANGED up are the
// observer events a client can subscribe to with RegisterNotification.
const CLIENT_CONNECTED: u32 = 0;
const CLIENT_STREAM_CONNECTED: u32 = 1;
const CLIENT_AUDIO_DEBUG_INFO_READY: u32 = 2;
const CLIENT_GET_HOTWORD_MODELS_READY: u32 = 3;
const CLIENT_OUTPUT_VOLUME_CHANGED: u32 = 4;
const CLIENT_OUTPUT_MUTE_CHANGED: u32 = 5;
const CLIENT_CAPTURE_GAIN_CHANGED: u32 = 6;
const CLIENT_CAPTURE_MUTE_CHANGED: u32 = 7;
const CLIENT_NODES_CHANGED: u32 = 8;
const CLIENT_ACTIVE_NODE_CHANGED: u32 = 9;
const CLIENT_OUTPUT_NODE_VOLUME_CHANGED: u32 = 10;
const CLIENT_NODE_LEFT_RIGHT_SWAPPED_CHANGED: u32 = 11;
const CLIENT_INPUT_NODE_GAIN_CHANGED: u32 = 12;
const CLIENT_NUM_ACTIVE_STREAMS_CHANGED: u32 = 13;

/// Messages sent from a client to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ConnectStream {
        proto_version: u32,
        direction: Direction,
        stream_id: StreamId,
        stream_type: StreamType,
        buffer_frames: u32,
        cb_threshold: u32,
        flags: u32,
        format: Format,
        dev_idx: u32,
    },
    DisconnectStream {
        stream_id: StreamId,
    },
    SetSystemVolume {
        volume: u32,
    },
    SetSystemMute {
        mute: bool,
    },
    SetUserMute {
        mute: bool,
    },
    SetSystemMuteLocked {
        locked: bool,
    },
    SetSystemCaptureGain {
        gain: i32,
    },
    SetSystemCaptureMute {
        mute: bool,
    },
    SetSystemCaptureMuteLocked {
        locked: bool,
    },
    SetNodeAttr {
        node_id: NodeId,
        attr: NodeAttr,
        value: i32,
    },
    SelectNode {
        direction: Direction,
        node_id: NodeId,
    },
    ReloadDsp,
    DumpDspInfo,
    DumpAudioThread,
    AddActiveNode {
        direction: Direction,
        node_id: NodeId,
    },
    RmActiveNode {
        direction: Direction,
        node_id: NodeId,
    },
    AddTestDev {
        dev_type: TestDevType,
    },
    TestDevCommand {
        command: TestDevCommand,
        dev_idx: u32,
        data: Vec<u8>,
    },
    Suspend,
    Resume,
    ConfigGlobalRemix {
        num_channels: u32,
        coefficients: Vec<f32>,
    },
    GetHotwordModels {
        node_id: NodeId,
    },
    SetHotwordModel {
        node_id: NodeId,
        model_name: String,
    },
    RegisterNotification {
        msg_id: u32,
        do_register: bool,
    },
}

/// Messages sent from the server to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Connected {
        client_id: u32,
    },
    StreamConnected {
        err: i32,
        stream_id: StreamId,
        format: Format,
        shm_max_size: u32,
    },
    AudioDebugInfoReady,
    GetHotwordModelsReady {
        models: String,
    },
    OutputVolumeChanged {
        volume: i32,
    },
    OutputMuteChanged {
        muted: bool,
        user_muted: bool,
        mute_locked: bool,
    },
    CaptureGainChanged {
        gain: i32,
    },
    CaptureMuteChanged {
        muted: bool,
        mute_locked: bool,
    },
    NodesChanged,
    ActiveNodeChanged {
        direction: Direction,
        node_id: NodeId,
    },
    OutputNodeVolumeChanged {
        node_id: NodeId,
        volume: i32,
    },
    NodeLeftRightSwappedChanged {
        node_id: NodeId,
        swapped: bool,
    },
    InputNodeGainChanged {
        node_id: NodeId,
        gain: i32,
    },
    NumActiveStreamsChanged {
        direction: Direction,
        num_active_streams: u32,
    },
}

impl ClientMessage {
    /// Wire id, used by RegisterNotification to name observer events.
    pub fn id(&self) -> u32 {
        match self {
            ClientMessage::Connected { .. } => CLIENT_CONNECTED,
            ClientMessage::StreamConnected { .. } => CLIENT_STREAM_CONNECTED,
            ClientMessage::AudioDebugInfoReady => CLIENT_AUDIO_DEBUG_INFO_READY,
            ClientMessage::GetHotwordModelsReady { .. } => CLIENT_GET_HOTWORD_MODELS_READY,
            ClientMessage::OutputVolumeChanged { .. } => CLIENT_OUTPUT_VOLUME_CHANGED,
            ClientMessage::OutputMuteChanged { .. } => CLIENT_OUTPUT_MUTE_CHANGED,
            ClientMessage::CaptureGainChanged { .. } => CLIENT_CAPTURE_GAIN_CHANGED,
            ClientMessage::CaptureMuteChanged { .. } => CLIENT_CAPTURE_MUTE_CHANGED,
            ClientMessage::NodesChanged => CLIENT_NODES_CHANGED,
            ClientMessage::ActiveNodeChanged { .. } => CLIENT_ACTIVE_NODE_CHANGED,
            ClientMessage::OutputNodeVolumeChanged { .. } => CLIENT_OUTPUT_NODE_VOLUME_CHANGED,
            ClientMessage::NodeLeftRightSwappedChanged { .. } => {
                CLIENT_NODE_LEFT_RIGHT_SWAPPED_CHANGED
            }
            ClientMessage::InputNodeGainChanged { .. } => CLIENT_INPUT_NODE_GAIN_CHANGED,
            ClientMessage::NumActiveStreamsChanged { .. } => CLIENT_NUM_ACTIVE_STREAMS_CHANGED,
        }
    }

    /// Range of ids valid in a RegisterNotification request.
    pub fn is_notification_id(id: u32) -> bool {
        (CLIENT_OUTPUT_VOLUME_CHANGED..=CLIENT_NUM_ACTIVE_STREAMS_CHANGED).contains(&id)
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new(id: u32) -> Self {
        let mut buf = Vec::with_capacity(MAX_MSG_SIZE);
        buf.extend_from_slice(&0u32.to_le_bytes()); // length patched in finish()
        buf.extend_from_slice(&id.to_le_bytes());
        Self { buf }
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bool(&mut self, v: bool) {
        self.i32(v as i32);
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn format(&mut self, fmt: &Format) {
        self.buf.extend_from_slice(&fmt.pack().0);
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_le_bytes());
        self.buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), ProtoError> {
        if self.pos + n > self.buf.len() {
            return Err(ProtoError::TooShort {
                got: self.buf.len(),
                need: self.pos + n,
            });
        }
        Ok(())
    }

    fn u32(&mut self) -> Result<u32, ProtoError> {
        self.need(4)?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn i32(&mut self) -> Result<i32, ProtoError> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64, ProtoError> {
        self.need(8)?;
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn f32(&mut self) -> Result<f32, ProtoError> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn bool(&mut self) -> Result<bool, ProtoError> {
        Ok(self.i32()? != 0)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        self.need(n)?;
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    fn rest(&mut self) -> &'a [u8] {
        let v = &self.buf[self.pos..];
        self.pos = self.buf.len();
        v
    }

    fn format(&mut self) -> Result<Format, ProtoError> {
        let raw = self.bytes(crate::format::PACKED_FORMAT_SIZE)?;
        let mut packed = crate::format::PackedFormat([0u8; crate::format::PACKED_FORMAT_SIZE]);
        packed.0.copy_from_slice(raw);
        Format::unpack(&packed)
    }

    fn direction(&mut self) -> Result<Direction, ProtoError> {
        Direction::from_u32(self.u32()?)
    }

    fn finish(self) -> Result<(), ProtoError> {
        let left = self.buf.len() - self.pos;
        if left != 0 {
            return Err(ProtoError::TrailingBytes(left));
        }
        Ok(())
    }
}

/// Validates the datagram header and returns (id, payload).
fn split_header(buf: &[u8]) -> Result<(u32, &[u8]), ProtoError> {
    if buf.len() < HEADER_SIZE {
        return Err(ProtoError::TooShort {
            got: buf.len(),
            need: HEADER_SIZE,
        });
    }
    let length = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if length as usize != buf.len() {
        return Err(ProtoError::LengthMismatch {
            length,
            actual: buf.len(),
        });
    }
    Ok((id, &buf[HEADER_SIZE..]))
}

impl ServerMessage {
    /// True when this message may exceed [`MAX_MSG_SIZE`].
    fn has_variable_tail(&self) -> bool {
        matches!(
            self,
            ServerMessage::TestDevCommand { .. } | ServerMessage::ConfigGlobalRemix { .. }
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let buf = match self {
            ServerMessage::ConnectStream {
                proto_version,
                direction,
                stream_id,
                stream_type,
                buffer_frames,
                cb_threshold,
                flags,
                format,
                dev_idx,
            } => {
                let mut w = Writer::new(SERVER_CONNECT_STREAM);
                w.u32(*proto_version);
                w.u32(*direction as u32);
                w.u64(*stream_id);
                w.u32(*stream_type as u32);
                w.u32(*buffer_frames);
                w.u32(*cb_threshold);
                w.u32(*flags);
                w.format(format);
                w.u32(*dev_idx);
                w.finish()
            }
            ServerMessage::DisconnectStream { stream_id } => {
                let mut w = Writer::new(SERVER_DISCONNECT_STREAM);
                w.u64(*stream_id);
                w.finish()
            }
            ServerMessage::SetSystemVolume { volume } => {
                let mut w = Writer::new(SERVER_SET_SYSTEM_VOLUME);
                w.u32(*volume);
                w.finish()
            }
            ServerMessage::SetSystemMute { mute } => {
                let mut w = Writer::new(SERVER_SET_SYSTEM_MUTE);
                w.bool(*mute);
                w.finish()
            }
            ServerMessage::SetUserMute { mute } => {
                let mut w = Writer::new(SERVER_SET_USER_MUTE);
                w.bool(*mute);
                w.finish()
            }
            ServerMessage::SetSystemMuteLocked { locked } => {
                let mut w = Writer::new(SERVER_SET_SYSTEM_MUTE_LOCKED);
                w.bool(*locked);
                w.finish()
            }
            ServerMessage::SetSystemCaptureGain { gain } => {
                let mut w = Writer::new(SERVER_SET_SYSTEM_CAPTURE_GAIN);
                w.i32(*gain);
                w.finish()
            }
            ServerMessage::SetSystemCaptureMute { mute } => {
                let mut w = Writer::new(SERVER_SET_SYSTEM_CAPTURE_MUTE);
                w.bool(*mute);
                w.finish()
            }
            ServerMessage::SetSystemCaptureMuteLocked { locked } => {
                let mut w = Writer::new(SERVER_SET_SYSTEM_CAPTURE_MUTE_LOCKED);
                w.bool(*locked);
                w.finish()
            }
            ServerMessage::SetNodeAttr {
                node_id,
                attr,
                value,
            } => {
                let mut w = Writer::new(SERVER_SET_NODE_ATTR);
                w.u64(*node_id);
                w.u32(*attr as u32);
                w.i32(*value);
                w.finish()
            }
            ServerMessage::SelectNode { direction, node_id } => {
                let mut w = Writer::new(SERVER_SELECT_NODE);
                w.u32(*direction as u32);
                w.u64(*node_id);
                w.finish()
            }
            ServerMessage::ReloadDsp => Writer::new(SERVER_RELOAD_DSP).finish(),
            ServerMessage::DumpDspInfo => Writer::new(SERVER_DUMP_DSP_INFO).finish(),
            ServerMessage::DumpAudioThread => Writer::new(SERVER_DUMP_AUDIO_THREAD).finish(),
            ServerMessage::AddActiveNode { direction, node_id } => {
                let mut w = Writer::new(SERVER_ADD_ACTIVE_NODE);
                w.u32(*direction as u32);
                w.u64(*node_id);
                w.finish()
            }
            ServerMessage::RmActiveNode { direction, node_id } => {
                let mut w = Writer::new(SERVER_RM_ACTIVE_NODE);
                w.u32(*direction as u32);
                w.u64(*node_id);
                w.finish()
            }
            ServerMessage::AddTestDev { dev_type } => {
                let mut w = Writer::new(SERVER_ADD_TEST_DEV);
                w.u32(*dev_type as u32);
                w.finish()
            }
            ServerMessage::TestDevCommand {
                command,
                dev_idx,
                data,
            } => {
                let mut w = Writer::new(SERVER_TEST_DEV_COMMAND);
                w.u32(*command as u32);
                w.u32(*dev_idx);
                w.u32(data.len() as u32);
                w.bytes(data);
                w.finish()
            }
            ServerMessage::Suspend => Writer::new(SERVER_SUSPEND).finish(),
            ServerMessage::Resume => Writer::new(SERVER_RESUME).finish(),
            ServerMessage::ConfigGlobalRemix {
                num_channels,
                coefficients,
            } => {
                let mut w = Writer::new(SERVER_CONFIG_GLOBAL_REMIX);
                w.u32(*num_channels);
                for c in coefficients {
                    w.f32(*c);
                }
                w.finish()
            }
            ServerMessage::GetHotwordModels { node_id } => {
                let mut w = Writer::new(SERVER_GET_HOTWORD_MODELS);
                w.u64(*node_id);
                w.finish()
            }
            ServerMessage::SetHotwordModel {
                node_id,
                model_name,
            } => {
                let mut w = Writer::new(SERVER_SET_HOTWORD_MODEL);
                w.u64(*node_id);
                let mut name = [0u8; HOTWORD_MODEL_NAME_MAX];
                let n = model_name.len().min(HOTWORD_MODEL_NAME_MAX);
                name[..n].copy_from_slice(&model_name.as_bytes()[..n]);
                w.bytes(&name);
                w.finish()
            }
            ServerMessage::RegisterNotification {
                msg_id,
                do_register,
            } => {
                let mut w = Writer::new(SERVER_REGISTER_NOTIFICATION);
                w.u32(*msg_id);
                w.bool(*do_register);
                w.finish()
            }
        };

        if !self.has_variable_tail() && buf.len() > MAX_MSG_SIZE {
            return Err(ProtoError::TooLarge(buf.len()));
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let (id, payload) = split_header(buf)?;
        let mut r = Reader::new(payload);
        let msg = match id {
            SERVER_CONNECT_STREAM => ServerMessage::ConnectStream {
                proto_version: r.u32()?,
                direction: r.direction()?,
                stream_id: r.u64()?,
                stream_type: StreamType::from_u32(r.u32()?)?,
                buffer_frames: r.u32()?,
                cb_threshold: r.u32()?,
                flags: r.u32()?,
                format: r.format()?,
                dev_idx: r.u32()?,
            },
            SERVER_DISCONNECT_STREAM => ServerMessage::DisconnectStream {
                stream_id: r.u64()?,
            },
            SERVER_SET_SYSTEM_VOLUME => ServerMessage::SetSystemVolume { volume: r.u32()? },
            SERVER_SET_SYSTEM_MUTE => ServerMessage::SetSystemMute { mute: r.bool()? },
            SERVER_SET_USER_MUTE => ServerMessage::SetUserMute { mute: r.bool()? },
            SERVER_SET_SYSTEM_MUTE_LOCKED => {
                ServerMessage::SetSystemMuteLocked { locked: r.bool()? }
            }
            SERVER_SET_SYSTEM_CAPTURE_GAIN => {
                ServerMessage::SetSystemCaptureGain { gain: r.i32()? }
            }
            SERVER_SET_SYSTEM_CAPTURE_MUTE => {
                ServerMessage::SetSystemCaptureMute { mute: r.bool()? }
            }
            SERVER_SET_SYSTEM_CAPTURE_MUTE_LOCKED => {
                ServerMessage::SetSystemCaptureMuteLocked { locked: r.bool()? }
            }
            SERVER_SET_NODE_ATTR => ServerMessage::SetNodeAttr {
                node_id: r.u64()?,
                attr: NodeAttr::from_u32(r.u32()?)?,
                value: r.i32()?,
            },
            SERVER_SELECT_NODE => ServerMessage::SelectNode {
                direction: r.direction()?,
                node_id: r.u64()?,
            },
            SERVER_RELOAD_DSP => ServerMessage::ReloadDsp,
            SERVER_DUMP_DSP_INFO => ServerMessage::DumpDspInfo,
            SERVER_DUMP_AUDIO_THREAD => ServerMessage::DumpAudioThread,
            SERVER_ADD_ACTIVE_NODE => ServerMessage::AddActiveNode {
                direction: r.direction()?,
                node_id: r.u64()?,
            },
            SERVER_RM_ACTIVE_NODE => ServerMessage::RmActiveNode {
                direction: r.direction()?,
                node_id: r.u64()?,
            },
            SERVER_ADD_TEST_DEV => ServerMessage::AddTestDev {
                dev_type: TestDevType::from_u32(r.u32()?)?,
            },
            SERVER_TEST_DEV_COMMAND => {
                let command = TestDevCommand::from_u32(r.u32()?)?;
                let dev_idx = r.u32()?;
                let data_len = r.u32()? as usize;
                let data = r.bytes(data_len)?.to_vec();
                ServerMessage::TestDevCommand {
                    command,
                    dev_idx,
                    data,
                }
            }
            SERVER_SUSPEND => ServerMessage::Suspend,
            SERVER_RESUME => ServerMessage::Resume,
            SERVER_CONFIG_GLOBAL_REMIX => {
                let num_channels = r.u32()?;
                let tail = r.rest();
                let mut coefficients = Vec::with_capacity(tail.len() / 4);
                for chunk in tail.chunks_exact(4) {
                    coefficients.push(f32::from_le_bytes(chunk.try_into().unwrap()));
                }
                ServerMessage::ConfigGlobalRemix {
                    num_channels,
                    coefficients,
                }
            }
            SERVER_GET_HOTWORD_MODELS => ServerMessage::GetHotwordModels { node_id: r.u64()? },
            SERVER_SET_HOTWORD_MODEL => {
                let node_id = r.u64()?;
                let raw = r.bytes(HOTWORD_MODEL_NAME_MAX)?;
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                let model_name = String::from_utf8_lossy(&raw[..end]).into_owned();
                ServerMessage::SetHotwordModel {
                    node_id,
                    model_name,
                }
            }
            SERVER_REGISTER_NOTIFICATION => ServerMessage::RegisterNotification {
                msg_id: r.u32()?,
                do_register: r.bool()?,
            },
            other => return Err(ProtoError::UnknownId(other)),
        };
        r.finish()?;
        Ok(msg)
    }
}

impl ClientMessage {
    fn has_variable_tail(&self) -> bool {
        matches!(self, ClientMessage::GetHotwordModelsReady { .. })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let buf = match self {
            ClientMessage::Connected { client_id } => {
                let mut w = Writer::new(CLIENT_CONNECTED);
                w.u32(*client_id);
                w.finish()
            }
            ClientMessage::StreamConnected {
                err,
                stream_id,
                format,
                shm_max_size,
            } => {
                let mut w = Writer::new(CLIENT_STREAM_CONNECTED);
                w.i32(*err);
                w.u64(*stream_id);
                w.format(format);
                w.u32(*shm_max_size);
                w.finish()
            }
            ClientMessage::AudioDebugInfoReady => {
                Writer::new(CLIENT_AUDIO_DEBUG_INFO_READY).finish()
            }
            ClientMessage::GetHotwordModelsReady { models } => {
                let mut w = Writer::new(CLIENT_GET_HOTWORD_MODELS_READY);
                w.u32(models.len() as u32);
                w.bytes(models.as_bytes());
                w.finish()
            }
            ClientMessage::OutputVolumeChanged { volume } => {
                let mut w = Writer::new(CLIENT_OUTPUT_VOLUME_CHANGED);
                w.i32(*volume);
                w.finish()
            }
            ClientMessage::OutputMuteChanged {
                muted,
                user_muted,
                mute_locked,
            } => {
                let mut w = Writer::new(CLIENT_OUTPUT_MUTE_CHANGED);
                w.bool(*muted);
                w.bool(*user_muted);
                w.bool(*mute_locked);
                w.finish()
            }
            ClientMessage::CaptureGainChanged { gain } => {
                let mut w = Writer::new(CLIENT_CAPTURE_GAIN_CHANGED);
                w.i32(*gain);
                w.finish()
            }
            ClientMessage::CaptureMuteChanged { muted, mute_locked } => {
                let mut w = Writer::new(CLIENT_CAPTURE_MUTE_CHANGED);
                w.bool(*muted);
                w.bool(*mute_locked);
                w.finish()
            }
            ClientMessage::NodesChanged => Writer::new(CLIENT_NODES_CHANGED).finish(),
            ClientMessage::ActiveNodeChanged { direction, node_id } => {
                let mut w = Writer::new(CLIENT_ACTIVE_NODE_CHANGED);
                w.u32(*direction as u32);
                w.u64(*node_id);
                w.finish()
            }
            ClientMessage::OutputNodeVolumeChanged { node_id, volume } => {
                let mut w = Writer::new(CLIENT_OUTPUT_NODE_VOLUME_CHANGED);
                w.u64(*node_id);
                w.i32(*volume);
                w.finish()
            }
            ClientMessage::NodeLeftRightSwappedChanged { node_id, swapped } => {
                let mut w = Writer::new(CLIENT_NODE_LEFT_RIGHT_SWAPPED_CHANGED);
                w.u64(*node_id);
                w.bool(*swapped);
                w.finish()
            }
            ClientMessage::InputNodeGainChanged { node_id, gain } => {
                let mut w = Writer::new(CLIENT_INPUT_NODE_GAIN_CHANGED);
                w.u64(*node_id);
                w.i32(*gain);
                w.finish()
            }
            ClientMessage::NumActiveStreamsChanged {
                direction,
                num_active_streams,
            } => {
                let mut w = Writer::new(CLIENT_NUM_ACTIVE_STREAMS_CHANGED);
                w.u32(*direction as u32);
                w.u32(*num_active_streams);
                w.finish()
            }
        };

        if !self.has_variable_tail() && buf.len() > MAX_MSG_SIZE {
            return Err(ProtoError::TooLarge(buf.len()));
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let (id, payload) = split_header(buf)?;
        let mut r = Reader::new(payload);
        let msg = match id {
            CLIENT_CONNECTED => ClientMessage::Connected {
                client_id: r.u32()?,
            },
            CLIENT_STREAM_CONNECTED => ClientMessage::StreamConnected {
                err: r.i32()?,
                stream_id: r.u64()?,
                format: r.format()?,
                shm_max_size: r.u32()?,
            },
            CLIENT_AUDIO_DEBUG_INFO_READY => ClientMessage::AudioDebugInfoReady,
            CLIENT_GET_HOTWORD_MODELS_READY => {
                let len = r.u32()? as usize;
                let raw = r.bytes(len)?;
                ClientMessage::GetHotwordModelsReady {
                    models: String::from_utf8_lossy(raw).into_owned(),
                }
            }
            CLIENT_OUTPUT_VOLUME_CHANGED => {
                ClientMessage::OutputVolumeChanged { volume: r.i32()? }
            }
            CLIENT_OUTPUT_MUTE_CHANGED => ClientMessage::OutputMuteChanged {
                muted: r.bool()?,
                user_muted: r.bool()?,
                mute_locked: r.bool()?,
            },
            CLIENT_CAPTURE_GAIN_CHANGED => ClientMessage::CaptureGainChanged { gain: r.i32()? },
            CLIENT_CAPTURE_MUTE_CHANGED => ClientMessage::CaptureMuteChanged {
                muted: r.bool()?,
                mute_locked: r.bool()?,
            },
            CLIENT_NODES_CHANGED => ClientMessage::NodesChanged,
            CLIENT_ACTIVE_NODE_CHANGED => ClientMessage::ActiveNodeChanged {
                direction: r.direction()?,
                node_id: r.u64()?,
            },
            CLIENT_OUTPUT_NODE_VOLUME_CHANGED => ClientMessage::OutputNodeVolumeChanged {
                node_id: r.u64()?,
                volume: r.i32()?,
            },
            CLIENT_NODE_LEFT_RIGHT_SWAPPED_CHANGED => {
                ClientMessage::NodeLeftRightSwappedChanged {
                    node_id: r.u64()?,
                    swapped: r.bool()?,
                }
            }
            CLIENT_INPUT_NODE_GAIN_CHANGED => ClientMessage::InputNodeGainChanged {
                node_id: r.u64()?,
                gain: r.i32()?,
            },
            CLIENT_NUM_ACTIVE_STREAMS_CHANGED => ClientMessage::NumActiveStreamsChanged {
                direction: r.direction()?,
                num_active_streams: r.u32()?,
            },
            other => return Err(ProtoError::UnknownId(other)),
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Ids for the fixed-size message exchanged over a stream's audio socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AudioMsgId {
    /// Server -> client: produce `frames` more frames into shm.
    RequestData = 0,
    /// Client -> server: `frames` frames committed to shm.
    DataReady = 1,
}

/// The record sent over the per-stream audio socketpair, always
/// [`AudioMessage::SIZE`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioMessage {
    pub id: AudioMsgId,
    pub error: i32,
    pub frames: u32,
}

impl AudioMessage {
    pub const SIZE: usize = 12;

    pub fn request_data(frames: u32) -> Self {
        Self {
            id: AudioMsgId::RequestData,
            error: 0,
            frames,
        }
    }

    pub fn data_ready(frames: u32) -> Self {
        Self {
            id: AudioMsgId::DataReady,
            error: 0,
            frames,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&(self.id as u32).to_le_bytes());
        out[4..8].copy_from_slice(&self.error.to_le_bytes());
        out[8..12].copy_from_slice(&self.frames.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < Self::SIZE {
            return Err(ProtoError::TooShort {
                got: buf.len(),
                need: Self::SIZE,
            });
        }
        let id = match u32::from_le_bytes(buf[0..4].try_into().unwrap()) {
            0 => AudioMsgId::RequestData,
            1 => AudioMsgId::DataReady,
            v => {
                return Err(ProtoError::BadEnumValue {
                    what: "AudioMsgId",
                    value: v,
                })
            }
        };
        Ok(Self {
            id,
            error: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            frames: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use crate::types::stream_id;

    #[test]
    fn test_connect_stream_round_trip() {
        let msg = ServerMessage::ConnectStream {
            proto_version: crate::PROTO_VERSION,
            direction: Direction::Output,
            stream_id: stream_id(3, 1),
            stream_type: StreamType::Multimedia,
            buffer_frames: 960,
            cb_threshold: 480,
            flags: crate::types::StreamFlags::BULK_AUDIO_OK,
            format: Format::new(SampleFormat::S16LE, 48000, 2),
            dev_idx: 0,
        };
        let wire = msg.encode().unwrap();
        assert!(wire.len() <= MAX_MSG_SIZE);
        assert_eq!(ServerMessage::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn test_header_length_must_match() {
        let wire = ServerMessage::Suspend.encode().unwrap();
        let mut truncated = wire.clone();
        truncated.push(0);
        assert!(matches!(
            ServerMessage::decode(&truncated),
            Err(ProtoError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_id_rejected() {
        let mut wire = ServerMessage::Suspend.encode().unwrap();
        wire[4..8].copy_from_slice(&2u32.to_le_bytes()); // reserved id
        assert!(matches!(
            ServerMessage::decode(&wire),
            Err(ProtoError::UnknownId(2))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        // A SetSystemVolume datagram padded with 4 extra bytes and a fixed-up
        // header length must not decode.
        let mut wire = ServerMessage::SetSystemVolume { volume: 50 }.encode().unwrap();
        wire.extend_from_slice(&[0u8; 4]);
        let len = wire.len() as u32;
        wire[0..4].copy_from_slice(&len.to_le_bytes());
        assert!(matches!(
            ServerMessage::decode(&wire),
            Err(ProtoError::TrailingBytes(4))
        ));
    }

    #[test]
    fn test_global_remix_tail() {
        let msg = ServerMessage::ConfigGlobalRemix {
            num_channels: 2,
            coefficients: vec![1.0, 0.0, 0.0, 1.0],
        };
        let wire = msg.encode().unwrap();
        assert_eq!(ServerMessage::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn test_large_remix_allowed_past_cap() {
        let msg = ServerMessage::ConfigGlobalRemix {
            num_channels: 8,
            coefficients: vec![0.5; 64],
        };
        let wire = msg.encode().unwrap();
        assert!(wire.len() > MAX_MSG_SIZE);
        assert_eq!(ServerMessage::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn test_hotword_model_name_padding() {
        let msg = ServerMessage::SetHotwordModel {
            node_id: 0x0000_0005_0000_0000,
            model_name: "en_us".to_string(),
        };
        let wire = msg.encode().unwrap();
        assert_eq!(ServerMessage::decode(&wire).unwrap(), msg);

        // Over-long names are truncated to the wire limit.
        let long = ServerMessage::SetHotwordModel {
            node_id: 1 << 32,
            model_name: "much_too_long_model".to_string(),
        };
        let wire = long.encode().unwrap();
        match ServerMessage::decode(&wire).unwrap() {
            ServerMessage::SetHotwordModel { model_name, .. } => {
                assert_eq!(model_name.len(), HOTWORD_MODEL_NAME_MAX);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_stream_connected_round_trip() {
        let msg = ClientMessage::StreamConnected {
            err: 0,
            stream_id: stream_id(1, 9),
            format: Format::new(SampleFormat::S32LE, 44100, 2),
            shm_max_size: 65536,
        };
        let wire = msg.encode().unwrap();
        assert_eq!(ClientMessage::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn test_mute_changed_carries_all_three_fields() {
        let msg = ClientMessage::OutputMuteChanged {
            muted: true,
            user_muted: false,
            mute_locked: true,
        };
        let wire = msg.encode().unwrap();
        assert_eq!(ClientMessage::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn test_notification_id_range() {
        assert!(ClientMessage::is_notification_id(
            ClientMessage::OutputVolumeChanged { volume: 0 }.id()
        ));
        assert!(ClientMessage::is_notification_id(
            ClientMessage::NumActiveStreamsChanged {
                direction: Direction::Input,
                num_active_streams: 0
            }
            .id()
        ));
        assert!(!ClientMessage::is_notification_id(
            ClientMessage::Connected { client_id: 0 }.id()
        ));
    }

    #[test]
    fn test_audio_message_fixed_size() {
        let msg = AudioMessage::request_data(480);
        let wire = msg.encode();
        assert_eq!(wire.len(), AudioMessage::SIZE);
        assert_eq!(AudioMessage::decode(&wire).unwrap(), msg);

        let ready = AudioMessage::data_ready(256);
        assert_eq!(AudioMessage::decode(&ready.encode()).unwrap(), ready);
    }
}
