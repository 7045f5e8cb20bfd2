//! The server: rendezvous socket and main event loop
//!
//! Owns the seqpacket listener, every client session, the main-thread side
//! of the audio thread, and the timers. One `poll()` loop multiplexes
//! accepts, client control messages, audio-thread notifications, and timer
//! deadlines. All control-plane state lives on this thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    accept4, bind, listen, socket, AddressFamily, SockFlag, SockType, UnixAddr,
};
use nix::sys::stat::{umask, Mode};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use sonara_proto::Direction;

use crate::audio_thread::{AudioThread, MainMsg};
use crate::device::CpalDevice;
use crate::error::{CoreError, CoreResult};
use crate::iodev_list::IoDevList;
use crate::observer::ObserverRegistry;
use crate::rclient::{ClientCtx, RClient};
use crate::system_state::SystemState;

/// Name of the rendezvous socket inside the state directory.
pub const SOCKET_FILE: &str = ".sonara_sock";

/// Server construction parameters, from the CLI.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding the rendezvous socket; created 0770 if missing.
    pub state_dir: PathBuf,
    /// JSON DSP pipeline config; absent means no processing.
    pub dsp_config_path: Option<PathBuf>,
    /// Directory with `devices.json` naming hardware devices to register.
    pub device_config_dir: Option<PathBuf>,
    /// Register default hardware devices through cpal.
    pub use_hw_devices: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/run/sonara"),
            dsp_config_path: None,
            device_config_dir: None,
            use_hw_devices: true,
        }
    }
}

/// `devices.json` in the device config directory.
#[derive(Debug, Default, Deserialize)]
struct DeviceConfigFile {
    #[serde(default)]
    outputs: Vec<DeviceEntry>,
    #[serde(default)]
    inputs: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
struct DeviceEntry {
    /// Backend device name; absent picks the host default.
    name: Option<String>,
}

pub struct Server {
    config: ServerConfig,
    listener: RawFd,
    socket_path: PathBuf,

    pub system: Rc<RefCell<SystemState>>,
    pub observers: Rc<ObserverRegistry>,
    pub audio_thread: Rc<AudioThread>,
    pub iodev_list: Rc<RefCell<IoDevList>>,
    ctx: Rc<ClientCtx>,

    clients: HashMap<u32, RClient>,
    next_client_id: u32,
}

fn load_dsp_config(path: &Option<PathBuf>) -> sonara_dsp::DspConfig {
    let Some(path) = path else {
        return sonara_dsp::DspConfig::default();
    };
    match std::fs::read_to_string(path).map_err(CoreError::Io).and_then(|text| {
        sonara_dsp::DspConfig::from_json(&text).map_err(CoreError::Dsp)
    }) {
        Ok(config) => config,
        Err(e) => {
            warn!("dsp config {path:?} unusable: {e}; running without dsp");
            sonara_dsp::DspConfig::default()
        }
    }
}

/// Creates the listening socket with group permissions set before bind, so
/// no window exists where the socket is accessible with wrong modes.
fn create_listener(state_dir: &Path) -> CoreResult<(RawFd, PathBuf)> {
    std::fs::create_dir_all(state_dir)?;
    std::fs::set_permissions(state_dir, std::fs::Permissions::from_mode(0o770))?;

    let socket_path = state_dir.join(SOCKET_FILE);
    let _ = std::fs::remove_file(&socket_path);

    let fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(&socket_path)?;

    // Group rw, no other: applied at bind time through the umask.
    let old_umask = umask(Mode::from_bits_truncate(0o007));
    let bind_result = bind(fd, &addr);
    umask(old_umask);
    bind_result?;

    listen(fd, 5)?;
    Ok((fd, socket_path))
}

impl Server {
    pub fn new(config: ServerConfig) -> CoreResult<Self> {
        let system = Rc::new(RefCell::new(SystemState::new()?));
        let observers = Rc::new(ObserverRegistry::new());
        let audio_thread = Rc::new(AudioThread::start(system.borrow().shared())?);
        let dsp_config = load_dsp_config(&config.dsp_config_path);
        let iodev_list = IoDevList::new(
            Rc::clone(&audio_thread),
            Rc::clone(&system),
            Rc::clone(&observers),
            dsp_config,
        )?;

        let (listener, socket_path) = create_listener(&config.state_dir)?;
        info!(path = %socket_path.display(), "listening");

        let ctx = Rc::new(ClientCtx {
            iodev_list: Rc::clone(&iodev_list),
            system: Rc::clone(&system),
            observers: Rc::clone(&observers),
            audio_thread: Rc::clone(&audio_thread),
            dsp_config_path: config.dsp_config_path.clone(),
        });

        let mut server = Self {
            config,
            listener,
            socket_path,
            system,
            observers,
            audio_thread,
            iodev_list,
            ctx,
            clients: HashMap::new(),
            next_client_id: 1,
        };
        server.register_hw_devices();
        Ok(server)
    }

    fn register_hw_devices(&mut self) {
        if !self.config.use_hw_devices {
            return;
        }
        let entries = self
            .config
            .device_config_dir
            .as_ref()
            .map(|dir| dir.join("devices.json"))
            .filter(|p| p.exists())
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|text| serde_json::from_str::<DeviceConfigFile>(&text).ok());

        let (outputs, inputs) = match entries {
            Some(file) => (file.outputs, file.inputs),
            // No config: one default device per direction.
            None => (
                vec![DeviceEntry { name: None }],
                vec![DeviceEntry { name: None }],
            ),
        };

        let mut list = self.iodev_list.borrow_mut();
        for entry in outputs {
            match list.add_device(Box::new(CpalDevice::new(0, Direction::Output, entry.name))) {
                Ok(idx) => {
                    if let Err(e) = list.enable_dev(idx) {
                        warn!(idx, "hw output enable deferred: {e}");
                    }
                }
                Err(e) => warn!("hw output registration failed: {e}"),
            }
        }
        for entry in inputs {
            match list.add_device(Box::new(CpalDevice::new(0, Direction::Input, entry.name))) {
                Ok(idx) => {
                    if let Err(e) = list.enable_dev(idx) {
                        warn!(idx, "hw input enable deferred: {e}");
                    }
                }
                Err(e) => warn!("hw input registration failed: {e}"),
            }
        }
    }

    /// Runs until `running` goes false. `running` is typically flipped by a
    /// signal handler in the binary.
    pub fn run(&mut self, running: &Arc<AtomicBool>) -> CoreResult<()> {
        while running.load(Ordering::SeqCst) {
            self.run_once(200)?;
        }
        info!("server loop exiting");
        self.shutdown();
        Ok(())
    }

    /// One poll iteration with an upper timeout bound in milliseconds.
    pub fn run_once(&mut self, max_wait_ms: i32) -> CoreResult<()> {
        let now = Instant::now();
        let timer_timeout = self
            .iodev_list
            .borrow()
            .next_timer_deadline()
            .map(|deadline| {
                deadline
                    .saturating_duration_since(now)
                    .as_millis()
                    .min(i32::MAX as u128) as i32
            });
        let timeout = match timer_timeout {
            Some(t) => t.min(max_wait_ms),
            None => max_wait_ms,
        };

        let client_fds: Vec<(u32, RawFd)> =
            self.clients.iter().map(|(id, c)| (*id, c.fd())).collect();

        let mut fds = Vec::with_capacity(2 + client_fds.len());
        fds.push(PollFd::new(self.listener, PollFlags::POLLIN));
        fds.push(PollFd::new(
            self.audio_thread.main_msg_fd(),
            PollFlags::POLLIN,
        ));
        for (_, fd) in &client_fds {
            fds.push(PollFd::new(*fd, PollFlags::POLLIN));
        }

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(nix::Error::EINTR) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let listener_ready = fds[0]
            .revents()
            .map(|r| r.contains(PollFlags::POLLIN))
            .unwrap_or(false);
        let audio_ready = fds[1]
            .revents()
            .map(|r| r.contains(PollFlags::POLLIN))
            .unwrap_or(false);
        let ready_clients: Vec<u32> = client_fds
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                fds[i + 2]
                    .revents()
                    .map(|r| !r.is_empty())
                    .unwrap_or(false)
            })
            .map(|(_, (id, _))| *id)
            .collect();
        drop(fds);

        if listener_ready {
            self.accept_clients();
        }
        if audio_ready {
            self.handle_audio_thread_msgs();
        }
        for id in ready_clients {
            self.service_client(id);
        }
        self.iodev_list.borrow_mut().handle_timers(Instant::now());
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match accept4(self.listener, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
                Ok(fd) => {
                    let id = self.next_client_id;
                    self.next_client_id += 1;
                    match RClient::new(id, fd, Rc::clone(&self.ctx)) {
                        Ok(client) => {
                            self.clients.insert(id, client);
                        }
                        Err(e) => warn!("client setup failed: {e}"),
                    }
                }
                Err(nix::Error::EAGAIN) => break,
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_audio_thread_msgs(&mut self) {
        for msg in self.audio_thread.drain_main_msgs() {
            match msg {
                MainMsg::ResetDevice { dev_idx } => {
                    self.iodev_list.borrow_mut().reset_device(dev_idx);
                }
                MainMsg::SetDeviceMuteState { dev_idx } => {
                    self.iodev_list.borrow_mut().set_device_mute_state(dev_idx);
                }
                MainMsg::StreamError { stream_id } => {
                    debug!(stream = format_args!("{stream_id:#x}"), "stream error");
                    let _ = self.iodev_list.borrow_mut().rm_stream(stream_id);
                }
                MainMsg::LongestFetchDelay { stream_id, millis } => {
                    info!(
                        stream = format_args!("{stream_id:#x}"),
                        millis, "longest fetch delay grew"
                    );
                }
            }
        }
    }

    fn service_client(&mut self, id: u32) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        match client.handle_readable() {
            Ok(()) => {}
            Err(e) => {
                if !e.is_transient() {
                    if let Some(mut client) = self.clients.remove(&id) {
                        client.destroy();
                    }
                }
            }
        }
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stops audio before tearing sockets down, so device close happens
    /// while the control plane is still alive.
    pub fn shutdown(&mut self) {
        self.audio_thread.stop();
        for (_, mut client) in self.clients.drain() {
            client.destroy();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
        let _ = nix::unistd::close(self.listener);
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{connect, MsgFlags};
    use sonara_proto::{ClientMessage, ServerMessage};

    fn test_server() -> (Server, tempdir::TempDirGuard) {
        let dir = tempdir::tempdir();
        let config = ServerConfig {
            state_dir: dir.path.clone(),
            dsp_config_path: None,
            device_config_dir: None,
            use_hw_devices: false,
        };
        (Server::new(config).unwrap(), dir)
    }

    // Minimal scoped temp dir; std has no built-in and the workspace does
    // not pull a crate in for one helper.
    mod tempdir {
        use std::path::PathBuf;

        pub struct TempDirGuard {
            pub path: PathBuf,
        }

        impl Drop for TempDirGuard {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.path);
            }
        }

        pub fn tempdir() -> TempDirGuard {
            use std::sync::atomic::{AtomicU32, Ordering};
            static COUNTER: AtomicU32 = AtomicU32::new(0);
            let path = std::env::temp_dir().join(format!(
                "sonara-test-{}-{}",
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::SeqCst)
            ));
            std::fs::create_dir_all(&path).unwrap();
            TempDirGuard { path }
        }
    }

    fn connect_client(server: &Server) -> RawFd {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .unwrap();
        let addr = UnixAddr::new(server.socket_path()).unwrap();
        connect(fd, &addr).unwrap();
        crate::unix::set_nonblocking(fd).unwrap();
        fd
    }

    fn recv_client_msg(fd: RawFd) -> Option<(ClientMessage, Vec<RawFd>)> {
        let mut buf = vec![0u8; 64 * 1024];
        for _ in 0..100 {
            match crate::unix::recv_with_fds(fd, &mut buf) {
                Ok((len, fds)) => {
                    return Some((ClientMessage::decode(&buf[..len]).unwrap(), fds))
                }
                Err(CoreError::Transient) => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn test_socket_created_with_group_permissions() {
        let (server, _dir) = test_server();
        let meta = std::fs::metadata(server.socket_path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o770);
    }

    #[test]
    fn test_accept_and_handshake() {
        let (mut server, _dir) = test_server();
        let fd = connect_client(&server);
        server.run_once(50).unwrap();
        assert_eq!(server.num_clients(), 1);

        let (msg, fds) = recv_client_msg(fd).expect("CLIENT_CONNECTED");
        assert!(matches!(msg, ClientMessage::Connected { client_id: 1 }));
        assert_eq!(fds.len(), 1, "system state shm fd");
        crate::unix::close_fds(&fds);
        let _ = nix::unistd::close(fd);
    }

    #[test]
    fn test_client_message_round_trip() {
        let (mut server, _dir) = test_server();
        let fd = connect_client(&server);
        server.run_once(50).unwrap();
        let _ = recv_client_msg(fd);

        let wire = ServerMessage::SetSystemVolume { volume: 61 }.encode().unwrap();
        nix::sys::socket::send(fd, &wire, MsgFlags::empty()).unwrap();
        server.run_once(50).unwrap();
        assert_eq!(server.system.borrow().volume(), 61);
        let _ = nix::unistd::close(fd);
    }

    #[test]
    fn test_client_hangup_removes_client() {
        let (mut server, _dir) = test_server();
        let fd = connect_client(&server);
        server.run_once(50).unwrap();
        assert_eq!(server.num_clients(), 1);

        let _ = nix::unistd::close(fd);
        server.run_once(50).unwrap();
        assert_eq!(server.num_clients(), 0);
    }

    #[test]
    fn test_two_clients_get_distinct_ids() {
        let (mut server, _dir) = test_server();
        let a = connect_client(&server);
        let b = connect_client(&server);
        server.run_once(50).unwrap();
        assert_eq!(server.num_clients(), 2);

        let (msg_a, fds_a) = recv_client_msg(a).unwrap();
        let (msg_b, fds_b) = recv_client_msg(b).unwrap();
        let id_a = match msg_a {
            ClientMessage::Connected { client_id } => client_id,
            _ => panic!(),
        };
        let id_b = match msg_b {
            ClientMessage::Connected { client_id } => client_id,
            _ => panic!(),
        };
        assert_ne!(id_a, id_b);
        crate::unix::close_fds(&fds_a);
        crate::unix::close_fds(&fds_b);
        let _ = nix::unistd::close(a);
        let _ = nix::unistd::close(b);
    }
}
