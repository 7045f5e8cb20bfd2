//! Per-client sessions
//!
//! Each accepted connection gets an `RClient`: it decodes framed control
//! messages, enforces the per-message fd policy (only `ConnectStream` may
//! carry one), dispatches into the subsystems, and forwards subscribed
//! observer events back over the client socket.

use std::cell::RefCell;
use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;

use nix::sys::socket::{getsockopt, sockopt};
use tracing::{debug, info, warn};

use sonara_proto::{
    stream_id_client, ClientMessage, ServerMessage, StreamId, PROTO_VERSION,
};

use crate::audio_thread::AudioThread;
use crate::error::{CoreError, CoreResult};
use crate::iodev_list::IoDevList;
use crate::observer::{Observer, ObserverEvent, ObserverRegistry};
use crate::stream::StreamConfig;
use crate::system_state::SystemState;
use crate::unix;

/// Shared handles every client session dispatches into.
pub struct ClientCtx {
    pub iodev_list: Rc<RefCell<IoDevList>>,
    pub system: Rc<RefCell<SystemState>>,
    pub observers: Rc<ObserverRegistry>,
    pub audio_thread: Rc<AudioThread>,
    pub dsp_config_path: Option<PathBuf>,
}

/// Peer credentials captured at accept.
#[derive(Debug, Clone, Copy)]
pub struct PeerCreds {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Forwards subscribed observer events to one client socket.
struct NotifForwarder {
    fd: RawFd,
    enabled: RefCell<HashSet<u32>>,
}

impl NotifForwarder {
    fn send(&self, msg: &ClientMessage) {
        let Ok(wire) = msg.encode() else { return };
        // Failures surface on the next control-plane read; observer
        // dispatch is not the place to tear a client down.
        let _ = unix::send_with_fds(self.fd, &wire, &[]);
    }
}

impl Observer for NotifForwarder {
    fn notify(&self, event: &ObserverEvent) {
        let msg = match *event {
            ObserverEvent::OutputVolumeChanged { volume } => {
                ClientMessage::OutputVolumeChanged { volume }
            }
            ObserverEvent::OutputMuteChanged {
                muted,
                user_muted,
                mute_locked,
            } => ClientMessage::OutputMuteChanged {
                muted,
                user_muted,
                mute_locked,
            },
            ObserverEvent::CaptureGainChanged { gain } => {
                ClientMessage::CaptureGainChanged { gain }
            }
            ObserverEvent::CaptureMuteChanged { muted, mute_locked } => {
                ClientMessage::CaptureMuteChanged { muted, mute_locked }
            }
            ObserverEvent::NodesChanged => ClientMessage::NodesChanged,
            ObserverEvent::ActiveNodeChanged { direction, node_id } => {
                ClientMessage::ActiveNodeChanged { direction, node_id }
            }
            ObserverEvent::OutputNodeVolumeChanged { node_id, volume } => {
                ClientMessage::OutputNodeVolumeChanged { node_id, volume }
            }
            ObserverEvent::NodeLeftRightSwappedChanged { node_id, swapped } => {
                ClientMessage::NodeLeftRightSwappedChanged { node_id, swapped }
            }
            ObserverEvent::InputNodeGainChanged { node_id, gain } => {
                ClientMessage::InputNodeGainChanged { node_id, gain }
            }
            ObserverEvent::NumActiveStreamsChanged {
                direction,
                num_active_streams,
            } => ClientMessage::NumActiveStreamsChanged {
                direction,
                num_active_streams,
            },
            // Suspend state has no client-facing message.
            ObserverEvent::SuspendChanged { .. } => return,
        };
        if self.enabled.borrow().contains(&msg.id()) {
            self.send(&msg);
        }
    }
}

/// One connected client.
pub struct RClient {
    pub id: u32,
    fd: RawFd,
    pub peer_creds: Option<PeerCreds>,
    ctx: Rc<ClientCtx>,
    forwarder: Rc<NotifForwarder>,
    observer_registration: Option<u64>,
}

impl RClient {
    /// Wraps an accepted connection and sends CLIENT_CONNECTED with the
    /// read-only system-state shm fd attached.
    pub fn new(id: u32, fd: RawFd, ctx: Rc<ClientCtx>) -> CoreResult<Self> {
        unix::set_nonblocking(fd)?;
        let peer_creds = getsockopt(fd, sockopt::PeerCredentials)
            .ok()
            .map(|c| PeerCreds {
                pid: c.pid(),
                uid: c.uid(),
                gid: c.gid(),
            });

        let client = Self {
            id,
            fd,
            peer_creds,
            forwarder: Rc::new(NotifForwarder {
                fd,
                enabled: RefCell::new(HashSet::new()),
            }),
            observer_registration: None,
            ctx,
        };

        let state_fd = client.ctx.system.borrow().shm_fd();
        client.send_message(&ClientMessage::Connected { client_id: id }, &[state_fd])?;
        info!(
            client = id,
            pid = client.peer_creds.map(|c| c.pid).unwrap_or(-1),
            "client connected"
        );
        Ok(client)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn send_message(&self, msg: &ClientMessage, fds: &[RawFd]) -> CoreResult<()> {
        let wire = msg.encode()?;
        match unix::send_with_fds(self.fd, &wire, fds) {
            Ok(_) => Ok(()),
            Err(CoreError::Sys(nix::Error::EPIPE)) => Err(CoreError::PeerGone),
            Err(e) => Err(e),
        }
    }

    /// Reads and dispatches everything queued on the client socket.
    /// `Err(PeerGone)` tells the server to tear this client down.
    pub fn handle_readable(&mut self) -> CoreResult<()> {
        loop {
            let mut buf = vec![0u8; 64 * 1024];
            let (len, fds) = match unix::recv_with_fds(self.fd, &mut buf) {
                Ok(v) => v,
                Err(CoreError::Transient) => return Ok(()),
                Err(e) => return Err(e),
            };
            if len == 0 {
                unix::close_fds(&fds);
                return Err(CoreError::PeerGone);
            }
            self.handle_message(&buf[..len], fds);
        }
    }

    fn handle_message(&mut self, wire: &[u8], fds: Vec<RawFd>) {
        let msg = match ServerMessage::decode(wire) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(client = self.id, "bad message: {e}");
                unix::close_fds(&fds);
                return;
            }
        };

        // Only CONNECT_STREAM may carry a file descriptor.
        if !matches!(msg, ServerMessage::ConnectStream { .. }) && !fds.is_empty() {
            warn!(client = self.id, "unexpected fd attached, dropping message");
            unix::close_fds(&fds);
            return;
        }

        match msg {
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
                let audio_fd = fds.first().copied().unwrap_or(-1);
                unix::close_fds(fds.get(1..).unwrap_or(&[]));
                let result = if proto_version != PROTO_VERSION {
                    unix::close_fds(&fds[..fds.len().min(1)]);
                    Err(CoreError::InvalidArgument("protocol version mismatch"))
                } else {
                    self.handle_connect_stream(StreamConfig {
                        stream_id,
                        stream_type,
                        direction,
                        dev_idx,
                        flags,
                        format,
                        buffer_frames,
                        cb_threshold,
                        audio_fd,
                    })
                };
                if let Err(e) = result {
                    debug!(client = self.id, "stream connect failed: {e}");
                    let _ = self.send_message(
                        &ClientMessage::StreamConnected {
                            err: e.wire_code(),
                            stream_id,
                            format,
                            shm_max_size: 0,
                        },
                        &[],
                    );
                }
            }
            ServerMessage::DisconnectStream { stream_id } => {
                if let Err(e) = self.handle_disconnect_stream(stream_id) {
                    debug!(client = self.id, "disconnect: {e}");
                }
            }
            ServerMessage::SetSystemVolume { volume } => {
                self.ctx
                    .system
                    .borrow_mut()
                    .set_volume(volume, &self.ctx.observers);
            }
            ServerMessage::SetSystemMute { mute } => {
                self.ctx
                    .system
                    .borrow_mut()
                    .set_mute(mute, &self.ctx.observers);
            }
            ServerMessage::SetUserMute { mute } => {
                self.ctx
                    .system
                    .borrow_mut()
                    .set_user_mute(mute, &self.ctx.observers);
            }
            ServerMessage::SetSystemMuteLocked { locked } => {
                self.ctx
                    .system
                    .borrow_mut()
                    .set_mute_locked(locked, &self.ctx.observers);
            }
            ServerMessage::SetSystemCaptureGain { gain } => {
                self.ctx
                    .system
                    .borrow_mut()
                    .set_capture_gain(gain, &self.ctx.observers);
            }
            ServerMessage::SetSystemCaptureMute { mute } => {
                self.ctx
                    .system
                    .borrow_mut()
                    .set_capture_mute(mute, &self.ctx.observers);
            }
            ServerMessage::SetSystemCaptureMuteLocked { locked } => {
                self.ctx
                    .system
                    .borrow_mut()
                    .set_capture_mute_locked(locked, &self.ctx.observers);
            }
            ServerMessage::SetNodeAttr {
                node_id,
                attr,
                value,
            } => {
                if let Err(e) = self
                    .ctx
                    .iodev_list
                    .borrow_mut()
                    .set_node_attr(node_id, attr, value)
                {
                    debug!(client = self.id, "set node attr: {e}");
                }
            }
            ServerMessage::SelectNode { direction, node_id } => {
                self.ctx
                    .iodev_list
                    .borrow_mut()
                    .select_node(direction, node_id);
            }
            ServerMessage::AddActiveNode { direction, node_id } => {
                self.ctx
                    .iodev_list
                    .borrow_mut()
                    .add_active_node(direction, node_id);
            }
            ServerMessage::RmActiveNode { direction, node_id } => {
                self.ctx
                    .iodev_list
                    .borrow_mut()
                    .rm_active_node(direction, node_id);
            }
            ServerMessage::ReloadDsp => self.handle_reload_dsp(),
            ServerMessage::DumpDspInfo => {
                self.ctx.iodev_list.borrow().dump_dsp_info();
            }
            ServerMessage::DumpAudioThread => self.handle_dump_audio_thread(),
            ServerMessage::AddTestDev { dev_type } => {
                if let Err(e) = self.ctx.iodev_list.borrow_mut().add_test_dev(dev_type) {
                    warn!("add test dev: {e}");
                }
            }
            ServerMessage::TestDevCommand {
                command,
                dev_idx,
                data,
            } => {
                if let Err(e) =
                    self.ctx
                        .iodev_list
                        .borrow_mut()
                        .test_dev_command(dev_idx, command, &data)
                {
                    debug!("test dev command: {e}");
                }
            }
            ServerMessage::Suspend => {
                self.ctx
                    .system
                    .borrow_mut()
                    .set_suspended(true, &self.ctx.observers);
            }
            ServerMessage::Resume => {
                self.ctx
                    .system
                    .borrow_mut()
                    .set_suspended(false, &self.ctx.observers);
            }
            ServerMessage::ConfigGlobalRemix {
                num_channels,
                coefficients,
            } => {
                if let Err(e) = self
                    .ctx
                    .audio_thread
                    .config_global_remix(num_channels, coefficients)
                {
                    warn!("config remix: {e}");
                }
            }
            ServerMessage::GetHotwordModels { node_id } => {
                let models = self
                    .ctx
                    .iodev_list
                    .borrow()
                    .get_hotword_models(node_id)
                    .unwrap_or_default();
                let _ = self.send_message(&ClientMessage::GetHotwordModelsReady { models }, &[]);
            }
            ServerMessage::SetHotwordModel {
                node_id,
                model_name,
            } => {
                if let Err(e) = self
                    .ctx
                    .iodev_list
                    .borrow_mut()
                    .set_hotword_model(node_id, &model_name)
                {
                    debug!("set hotword model: {e}");
                }
            }
            ServerMessage::RegisterNotification {
                msg_id,
                do_register,
            } => self.handle_register_notification(msg_id, do_register),
        }
    }

    fn handle_connect_stream(&mut self, config: StreamConfig) -> CoreResult<()> {
        if config.audio_fd < 0 {
            return Err(CoreError::InvalidArgument("missing audio fd"));
        }
        // Stream ids embed the owning client; a mismatch would break
        // teardown bookkeeping.
        if stream_id_client(config.stream_id) != self.id {
            let _ = nix::unistd::close(config.audio_fd);
            return Err(CoreError::InvalidArgument("stream id not owned by client"));
        }
        unix::set_nonblocking(config.audio_fd)?;

        let stream_id = config.stream_id;
        let format = config.format;
        let stream = self.ctx.iodev_list.borrow_mut().add_stream(config)?;

        let (shm_fd, shm_max_size) = {
            let s = stream.lock().unwrap();
            (s.shm().fd(), s.shm().total_size() as u32)
        };
        debug!(
            client = self.id,
            stream = format_args!("{stream_id:#x}"),
            "stream connected"
        );
        // Input shm fd then output shm fd; one region serves both
        // directions of a unidirectional stream.
        self.send_message(
            &ClientMessage::StreamConnected {
                err: 0,
                stream_id,
                format,
                shm_max_size,
            },
            &[shm_fd, shm_fd],
        )
        .map_err(|e| {
            let _ = self.ctx.iodev_list.borrow_mut().rm_stream(stream_id);
            e
        })?;
        Ok(())
    }

    fn handle_disconnect_stream(&mut self, stream_id: StreamId) -> CoreResult<()> {
        if stream_id_client(stream_id) != self.id {
            return Err(CoreError::InvalidArgument("stream id not owned by client"));
        }
        self.ctx.iodev_list.borrow_mut().rm_stream(stream_id)
    }

    fn handle_reload_dsp(&mut self) {
        let config = match &self.ctx.dsp_config_path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) => match sonara_dsp::DspConfig::from_json(&text) {
                    Ok(config) => config,
                    Err(e) => {
                        warn!("dsp config parse failed: {e}");
                        return;
                    }
                },
                Err(e) => {
                    warn!("dsp config read failed: {e}");
                    return;
                }
            },
            None => sonara_dsp::DspConfig::default(),
        };
        self.ctx.iodev_list.borrow_mut().reload_dsp(config);
    }

    fn handle_dump_audio_thread(&mut self) {
        match self.ctx.audio_thread.dump_debug_info() {
            Ok(dump) => {
                self.ctx.system.borrow_mut().set_debug_info(&dump);
                let _ = self.send_message(&ClientMessage::AudioDebugInfoReady, &[]);
            }
            Err(e) => warn!("audio thread dump: {e}"),
        }
    }

    fn handle_register_notification(&mut self, msg_id: u32, do_register: bool) {
        if !ClientMessage::is_notification_id(msg_id) {
            warn!(client = self.id, msg_id, "invalid notification id");
            return;
        }
        {
            let mut enabled = self.forwarder.enabled.borrow_mut();
            if do_register {
                enabled.insert(msg_id);
            } else {
                enabled.remove(&msg_id);
            }
        }

        let empty = self.forwarder.enabled.borrow().is_empty();
        match (empty, self.observer_registration) {
            (true, Some(reg)) => {
                self.ctx.observers.remove(reg);
                self.observer_registration = None;
            }
            (false, None) => {
                self.observer_registration = Some(
                    self.ctx
                        .observers
                        .add(Rc::clone(&self.forwarder) as Rc<dyn Observer>),
                );
            }
            _ => {}
        }
    }

    /// Tears down everything the client owns. Called by the server before
    /// dropping the session.
    pub fn destroy(&mut self) {
        if let Some(reg) = self.observer_registration.take() {
            self.ctx.observers.remove(reg);
        }
        self.ctx
            .iodev_list
            .borrow_mut()
            .rm_all_client_streams(self.id);
        info!(client = self.id, "client removed");
    }
}

impl Drop for RClient {
    fn drop(&mut self) {
        if let Some(reg) = self.observer_registration.take() {
            self.ctx.observers.remove(reg);
        }
        let _ = nix::unistd::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iodev_list::test_support::harness;
    use sonara_proto::{stream_id, Direction, Format, SampleFormat, StreamType};

    fn client_pair(ctx: &Rc<ClientCtx>, id: u32) -> (RClient, RawFd) {
        let (server_fd, client_fd) = nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::SeqPacket,
            None,
            nix::sys::socket::SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        crate::unix::set_nonblocking(client_fd).unwrap();
        let client = RClient::new(id, server_fd, Rc::clone(ctx)).unwrap();
        (client, client_fd)
    }

    fn ctx_from_harness(h: &crate::iodev_list::test_support::Harness) -> Rc<ClientCtx> {
        Rc::new(ClientCtx {
            iodev_list: Rc::clone(&h.list),
            system: Rc::clone(&h.system),
            observers: Rc::clone(&h.observers),
            audio_thread: Rc::clone(&h.audio_thread),
            dsp_config_path: None,
        })
    }

    fn recv_msg(fd: RawFd) -> (ClientMessage, Vec<RawFd>) {
        let mut buf = vec![0u8; 64 * 1024];
        let (len, fds) = crate::unix::recv_with_fds(fd, &mut buf).unwrap();
        (ClientMessage::decode(&buf[..len]).unwrap(), fds)
    }

    fn connect_stream_msg(id: u64) -> ServerMessage {
        ServerMessage::ConnectStream {
            proto_version: PROTO_VERSION,
            direction: Direction::Output,
            stream_id: id,
            stream_type: StreamType::Default,
            buffer_frames: 960,
            cb_threshold: 480,
            flags: 0,
            format: Format::new(SampleFormat::S16LE, 48000, 2),
            dev_idx: sonara_proto::NO_DEVICE,
        }
    }

    #[test]
    fn test_connected_message_carries_state_fd() {
        let h = harness();
        let ctx = ctx_from_harness(&h);
        let (client, client_fd) = client_pair(&ctx, 1);

        let (msg, fds) = recv_msg(client_fd);
        assert_eq!(msg, ClientMessage::Connected { client_id: 1 });
        assert_eq!(fds.len(), 1, "system state shm fd attached");
        crate::unix::close_fds(&fds);
        drop(client);
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_connect_stream_replies_with_two_shm_fds() {
        let h = harness();
        let ctx = ctx_from_harness(&h);
        let (mut client, client_fd) = client_pair(&ctx, 1);
        let _ = recv_msg(client_fd); // Connected

        // Client-side audio socketpair; one end rides the message.
        let (audio_theirs, audio_mine) = crate::unix::audio_socketpair().unwrap();
        let wire = connect_stream_msg(stream_id(1, 1)).encode().unwrap();
        crate::unix::send_with_fds(client_fd, &wire, &[audio_theirs]).unwrap();
        let _ = nix::unistd::close(audio_theirs);

        client.handle_readable().unwrap();
        let (msg, fds) = recv_msg(client_fd);
        match msg {
            ClientMessage::StreamConnected {
                err,
                stream_id: id,
                shm_max_size,
                ..
            } => {
                assert_eq!(err, 0);
                assert_eq!(id, stream_id(1, 1));
                assert!(shm_max_size > 0);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(fds.len(), 2, "input and output shm fds");
        crate::unix::close_fds(&fds);

        assert_eq!(h.list.borrow().stream_list().len(), 1);
        client.destroy();
        assert_eq!(h.list.borrow().stream_list().len(), 0);
        let _ = nix::unistd::close(audio_mine);
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_connect_stream_bad_params_reports_error() {
        let h = harness();
        let ctx = ctx_from_harness(&h);
        let (mut client, client_fd) = client_pair(&ctx, 1);
        let _ = recv_msg(client_fd);

        let (audio_theirs, audio_mine) = crate::unix::audio_socketpair().unwrap();
        let msg = ServerMessage::ConnectStream {
            proto_version: PROTO_VERSION,
            direction: Direction::Output,
            stream_id: stream_id(1, 1),
            stream_type: StreamType::Default,
            buffer_frames: 960,
            cb_threshold: 941, // above half the buffer
            flags: 0,
            format: Format::new(SampleFormat::S16LE, 48000, 2),
            dev_idx: sonara_proto::NO_DEVICE,
        };
        crate::unix::send_with_fds(client_fd, &msg.encode().unwrap(), &[audio_theirs]).unwrap();
        let _ = nix::unistd::close(audio_theirs);

        client.handle_readable().unwrap();
        let (reply, fds) = recv_msg(client_fd);
        match reply {
            ClientMessage::StreamConnected { err, .. } => {
                assert!(err < 0, "error code reported");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(fds.is_empty());
        assert!(h.list.borrow().stream_list().is_empty());
        let _ = nix::unistd::close(audio_mine);
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_foreign_stream_id_rejected() {
        let h = harness();
        let ctx = ctx_from_harness(&h);
        let (mut client, client_fd) = client_pair(&ctx, 1);
        let _ = recv_msg(client_fd);

        let (audio_theirs, audio_mine) = crate::unix::audio_socketpair().unwrap();
        // Stream id claims client 7.
        let wire = connect_stream_msg(stream_id(7, 1)).encode().unwrap();
        crate::unix::send_with_fds(client_fd, &wire, &[audio_theirs]).unwrap();
        let _ = nix::unistd::close(audio_theirs);

        client.handle_readable().unwrap();
        let (reply, _) = recv_msg(client_fd);
        assert!(matches!(
            reply,
            ClientMessage::StreamConnected { err, .. } if err < 0
        ));
        let _ = nix::unistd::close(audio_mine);
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_fd_on_non_connect_message_is_dropped() {
        let h = harness();
        let ctx = ctx_from_harness(&h);
        let (mut client, client_fd) = client_pair(&ctx, 1);
        let _ = recv_msg(client_fd);

        let (extra, extra2) = crate::unix::audio_socketpair().unwrap();
        let wire = ServerMessage::SetSystemVolume { volume: 12 }.encode().unwrap();
        crate::unix::send_with_fds(client_fd, &wire, &[extra]).unwrap();
        let _ = nix::unistd::close(extra);

        client.handle_readable().unwrap();
        // The message was dropped: volume unchanged.
        assert_eq!(h.system.borrow().volume(), 100);
        let _ = nix::unistd::close(extra2);
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_volume_message_mutates_system_state() {
        let h = harness();
        let ctx = ctx_from_harness(&h);
        let (mut client, client_fd) = client_pair(&ctx, 1);
        let _ = recv_msg(client_fd);

        let wire = ServerMessage::SetSystemVolume { volume: 37 }.encode().unwrap();
        crate::unix::send_with_fds(client_fd, &wire, &[]).unwrap();
        client.handle_readable().unwrap();
        assert_eq!(h.system.borrow().volume(), 37);
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_notification_registration_and_delivery() {
        let h = harness();
        let ctx = ctx_from_harness(&h);
        let (mut client, client_fd) = client_pair(&ctx, 1);
        let _ = recv_msg(client_fd);

        let volume_changed_id = ClientMessage::OutputVolumeChanged { volume: 0 }.id();
        let wire = ServerMessage::RegisterNotification {
            msg_id: volume_changed_id,
            do_register: true,
        }
        .encode()
        .unwrap();
        crate::unix::send_with_fds(client_fd, &wire, &[]).unwrap();
        client.handle_readable().unwrap();
        assert_eq!(h.observers.len(), 2, "device list + this client");

        h.system
            .borrow_mut()
            .set_volume(42, &h.observers);
        let (msg, _) = recv_msg(client_fd);
        assert_eq!(msg, ClientMessage::OutputVolumeChanged { volume: 42 });

        // Unsubscribing the only event drops the observer.
        let wire = ServerMessage::RegisterNotification {
            msg_id: volume_changed_id,
            do_register: false,
        }
        .encode()
        .unwrap();
        crate::unix::send_with_fds(client_fd, &wire, &[]).unwrap();
        client.handle_readable().unwrap();
        assert_eq!(h.observers.len(), 1);
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_hotword_models_round_trip() {
        let h = harness();
        let ctx = ctx_from_harness(&h);
        let (mut client, client_fd) = client_pair(&ctx, 1);
        let _ = recv_msg(client_fd);

        let dev_idx = h
            .list
            .borrow_mut()
            .add_test_dev(sonara_proto::TestDevType::Hotword)
            .unwrap();
        let wire = ServerMessage::GetHotwordModels {
            node_id: sonara_proto::node_id(dev_idx, 0),
        }
        .encode()
        .unwrap();
        crate::unix::send_with_fds(client_fd, &wire, &[]).unwrap();
        client.handle_readable().unwrap();

        let (reply, _) = recv_msg(client_fd);
        match reply {
            ClientMessage::GetHotwordModelsReady { models } => {
                assert!(models.contains("default"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        let _ = nix::unistd::close(client_fd);
    }

    #[test]
    fn test_hangup_reports_peer_gone() {
        let h = harness();
        let ctx = ctx_from_harness(&h);
        let (mut client, client_fd) = client_pair(&ctx, 1);
        let _ = recv_msg(client_fd);

        let _ = nix::unistd::close(client_fd);
        assert!(matches!(
            client.handle_readable(),
            Err(CoreError::PeerGone)
        ));
    }
}
