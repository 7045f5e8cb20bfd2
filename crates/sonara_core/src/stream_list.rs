//! Ordered registry of all client streams
//!
//! Insertion order is the service order. Add and remove fan out to a
//! delegate (the device list glue) that performs the routing side effects;
//! construction is parameterized so tests can substitute stream creation.

use std::rc::Rc;
use std::sync::{Arc, Mutex};

use sonara_proto::StreamId;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::stream::{Stream, StreamConfig};

/// Engine glue invoked on membership changes.
pub trait StreamListDelegate {
    /// A stream was added; attach it to the appropriate devices.
    fn stream_added(&self, stream: &Arc<Mutex<Stream>>) -> CoreResult<()>;
    /// A stream is being removed; detach it everywhere.
    fn stream_removed(&self, stream: &Arc<Mutex<Stream>>) -> CoreResult<()>;
}

type CreateFn = Box<dyn Fn(StreamConfig) -> CoreResult<Stream>>;

pub struct StreamList {
    streams: Vec<Arc<Mutex<Stream>>>,
    delegate: Option<Rc<dyn StreamListDelegate>>,
    create: CreateFn,
}

impl StreamList {
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            delegate: None,
            create: Box::new(Stream::new),
        }
    }

    /// Substitute the stream constructor (tests).
    pub fn with_create(create: CreateFn) -> Self {
        Self {
            streams: Vec::new(),
            delegate: None,
            create,
        }
    }

    pub fn set_delegate(&mut self, delegate: Rc<dyn StreamListDelegate>) {
        self.delegate = Some(delegate);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Mutex<Stream>>> {
        self.streams.iter()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn get(&self, id: StreamId) -> Option<&Arc<Mutex<Stream>>> {
        self.streams.iter().find(|s| s.lock().unwrap().id == id)
    }

    /// Creates a stream and runs the add glue. On glue failure the stream
    /// is destroyed and the error returned to the caller.
    pub fn add(&mut self, config: StreamConfig) -> CoreResult<Arc<Mutex<Stream>>> {
        let id = config.stream_id;
        if self.get(id).is_some() {
            return Err(CoreError::InvalidArgument("duplicate stream id"));
        }
        let stream = Arc::new(Mutex::new((self.create)(config)?));
        self.streams.push(Arc::clone(&stream));

        if let Some(delegate) = self.delegate.clone() {
            if let Err(e) = delegate.stream_added(&stream) {
                debug!(stream = format_args!("{id:#x}"), "add glue failed: {e}");
                self.streams.retain(|s| !Arc::ptr_eq(s, &stream));
                return Err(e);
            }
        }
        Ok(stream)
    }

    /// Removes a stream without running the delegate glue; the caller
    /// handles detachment itself.
    pub fn rm_silent(&mut self, id: StreamId) -> CoreResult<Arc<Mutex<Stream>>> {
        let pos = self
            .streams
            .iter()
            .position(|s| s.lock().unwrap().id == id)
            .ok_or(CoreError::NoSuchStream(id))?;
        Ok(self.streams.remove(pos))
    }

    /// Removes a stream, detaching it from every device first.
    pub fn rm(&mut self, id: StreamId) -> CoreResult<()> {
        let pos = self
            .streams
            .iter()
            .position(|s| s.lock().unwrap().id == id)
            .ok_or(CoreError::NoSuchStream(id))?;
        let stream = self.streams.remove(pos);
        if let Some(delegate) = self.delegate.clone() {
            delegate.stream_removed(&stream)?;
        }
        Ok(())
    }

    /// Removes every stream owned by `client_id` (client teardown).
    pub fn rm_all_client_streams(&mut self, client_id: u32) {
        let ids: Vec<StreamId> = self
            .streams
            .iter()
            .map(|s| s.lock().unwrap().id)
            .filter(|id| sonara_proto::stream_id_client(*id) == client_id)
            .collect();
        for id in ids {
            if let Err(e) = self.rm(id) {
                debug!("client stream teardown: {e}");
            }
        }
    }
}

impl Default for StreamList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::test_support::make_stream;
    use sonara_proto::{stream_id, Direction};
    use std::cell::RefCell;

    struct RecordingDelegate {
        added: RefCell<Vec<StreamId>>,
        removed: RefCell<Vec<StreamId>>,
        fail_add: bool,
    }

    impl StreamListDelegate for RecordingDelegate {
        fn stream_added(&self, stream: &Arc<Mutex<Stream>>) -> CoreResult<()> {
            if self.fail_add {
                return Err(CoreError::ResourceExhausted("test"));
            }
            self.added.borrow_mut().push(stream.lock().unwrap().id);
            Ok(())
        }

        fn stream_removed(&self, stream: &Arc<Mutex<Stream>>) -> CoreResult<()> {
            self.removed.borrow_mut().push(stream.lock().unwrap().id);
            Ok(())
        }
    }

    fn delegate(fail_add: bool) -> Rc<RecordingDelegate> {
        Rc::new(RecordingDelegate {
            added: RefCell::new(Vec::new()),
            removed: RefCell::new(Vec::new()),
            fail_add,
        })
    }

    fn list_with_fake_create() -> StreamList {
        StreamList::with_create(Box::new(|config| {
            let (stream, client_fd) = make_stream(config.direction, config.stream_id);
            // The client end leaks in tests; fine for process-lifetime tests.
            let _ = client_fd;
            // make_stream ignores most of config; id and direction are what
            // the registry cares about.
            let _ = config;
            Ok(stream)
        }))
    }

    #[test]
    fn test_add_notifies_delegate_in_order() {
        let mut list = list_with_fake_create();
        let d = delegate(false);
        list.set_delegate(d.clone());

        list.add(fake_config(stream_id(1, 1))).unwrap();
        list.add(fake_config(stream_id(1, 2))).unwrap();
        assert_eq!(*d.added.borrow(), vec![stream_id(1, 1), stream_id(1, 2)]);
        assert_eq!(list.len(), 2);

        let order: Vec<StreamId> = list.iter().map(|s| s.lock().unwrap().id).collect();
        assert_eq!(order, vec![stream_id(1, 1), stream_id(1, 2)]);
    }

    fn fake_config(id: StreamId) -> StreamConfig {
        StreamConfig {
            stream_id: id,
            stream_type: sonara_proto::StreamType::Default,
            direction: Direction::Output,
            dev_idx: sonara_proto::NO_DEVICE,
            flags: 0,
            format: sonara_proto::Format::default(),
            buffer_frames: 960,
            cb_threshold: 480,
            audio_fd: -1,
        }
    }

    #[test]
    fn test_failed_add_rolls_back() {
        let mut list = list_with_fake_create();
        list.set_delegate(delegate(true));
        assert!(list.add(fake_config(stream_id(1, 1))).is_err());
        assert!(list.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut list = list_with_fake_create();
        list.set_delegate(delegate(false));
        list.add(fake_config(stream_id(1, 1))).unwrap();
        assert!(matches!(
            list.add(fake_config(stream_id(1, 1))),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rm_notifies_and_drops() {
        let mut list = list_with_fake_create();
        let d = delegate(false);
        list.set_delegate(d.clone());
        list.add(fake_config(stream_id(1, 1))).unwrap();
        list.rm(stream_id(1, 1)).unwrap();
        assert_eq!(*d.removed.borrow(), vec![stream_id(1, 1)]);
        assert!(list.is_empty());
        assert!(matches!(
            list.rm(stream_id(1, 1)),
            Err(CoreError::NoSuchStream(_))
        ));
    }

    #[test]
    fn test_rm_all_client_streams() {
        let mut list = list_with_fake_create();
        let d = delegate(false);
        list.set_delegate(d.clone());
        list.add(fake_config(stream_id(1, 1))).unwrap();
        list.add(fake_config(stream_id(2, 1))).unwrap();
        list.add(fake_config(stream_id(1, 2))).unwrap();

        list.rm_all_client_streams(1);
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().next().unwrap().lock().unwrap().id, stream_id(2, 1));
    }
}
