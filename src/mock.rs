//! Deterministic reactor and stream doubles used by the test suites.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use memchr::memmem;

use crate::rt::io::{CloseCallback, ReadCallback, Stream, WriteCallback};
use crate::rt::{Callback, Reactor, Timeout};

/// A reactor with a manual clock. Timers only fire inside
/// [`advance`](MockReactor::advance); fd handlers only fire through
/// [`fire_handler`](MockReactor::fire_handler).
pub(crate) struct MockReactor {
    now: Cell<Instant>,
    next_token: Cell<u64>,
    timers: RefCell<Vec<ScheduledTimeout>>,
    handlers: RefCell<HashMap<RawFd, Box<dyn FnMut()>>>,
    removed: RefCell<HashSet<RawFd>>,
}

struct ScheduledTimeout {
    token: u64,
    deadline: Instant,
    callback: Callback,
}

impl MockReactor {
    pub(crate) fn new() -> Rc<MockReactor> {
        Rc::new(MockReactor {
            now: Cell::new(Instant::now()),
            next_token: Cell::new(1),
            timers: RefCell::new(Vec::new()),
            handlers: RefCell::new(HashMap::new()),
            removed: RefCell::new(HashSet::new()),
        })
    }

    /// Moves the clock forward, firing due timers in deadline order.
    pub(crate) fn advance(&self, duration: Duration) {
        let target = self.now.get() + duration;
        loop {
            let due = {
                let mut timers = self.timers.borrow_mut();
                let index = timers
                    .iter()
                    .enumerate()
                    .filter(|(_, timer)| timer.deadline <= target)
                    .min_by_key(|(_, timer)| timer.deadline)
                    .map(|(index, _)| index);
                index.map(|index| timers.remove(index))
            };
            let timer = match due {
                Some(timer) => timer,
                None => break,
            };
            if timer.deadline > self.now.get() {
                self.now.set(timer.deadline);
            }
            (timer.callback)();
        }
        self.now.set(target);
    }

    /// Runs the readable handler registered for `fd`, if any.
    pub(crate) fn fire_handler(&self, fd: RawFd) {
        self.removed.borrow_mut().remove(&fd);
        let mut handler = match self.handlers.borrow_mut().remove(&fd) {
            Some(handler) => handler,
            None => return,
        };
        handler();
        // Put the handler back unless it unregistered itself meanwhile.
        if !self.removed.borrow_mut().remove(&fd) {
            self.handlers.borrow_mut().insert(fd, handler);
        }
    }

    pub(crate) fn timer_count(&self) -> usize {
        self.timers.borrow().len()
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.handlers.borrow().len()
    }
}

impl Reactor for MockReactor {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn add_timeout(&self, deadline: Instant, callback: Callback) -> Timeout {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        self.timers.borrow_mut().push(ScheduledTimeout {
            token,
            deadline,
            callback,
        });
        Timeout(token)
    }

    fn remove_timeout(&self, timeout: &Timeout) {
        self.timers.borrow_mut().retain(|timer| timer.token != timeout.0);
    }

    fn add_handler(&self, fd: RawFd, callback: Box<dyn FnMut()>) {
        self.removed.borrow_mut().remove(&fd);
        self.handlers.borrow_mut().insert(fd, callback);
    }

    fn remove_handler(&self, fd: RawFd) {
        self.handlers.borrow_mut().remove(&fd);
        self.removed.borrow_mut().insert(fd);
    }
}

enum PendingRead {
    Until(&'static [u8], ReadCallback),
    Exactly(usize, ReadCallback),
}

/// A scripted stream. Inbound bytes arrive via [`feed`](MockStream::feed)
/// and satisfy reads synchronously; everything the server writes
/// accumulates in [`written`](MockStream::written). Writes complete
/// immediately unless [`delay_writes`](MockStream::delay_writes) is on.
pub(crate) struct MockStream {
    read_buffer: RefCell<BytesMut>,
    pending_read: RefCell<Option<PendingRead>>,
    written: RefCell<BytesMut>,
    write_callbacks: RefCell<VecDeque<WriteCallback>>,
    writes_in_flight: Cell<usize>,
    delay: Cell<bool>,
    closed: Cell<bool>,
    close_callback: RefCell<Option<CloseCallback>>,
    max_buffer_size: Cell<usize>,
    tls: Cell<bool>,
    certificate: RefCell<Option<Bytes>>,
}

impl MockStream {
    pub(crate) fn new() -> Rc<MockStream> {
        Rc::new(MockStream {
            read_buffer: RefCell::new(BytesMut::new()),
            pending_read: RefCell::new(None),
            written: RefCell::new(BytesMut::new()),
            write_callbacks: RefCell::new(VecDeque::new()),
            writes_in_flight: Cell::new(0),
            delay: Cell::new(false),
            closed: Cell::new(false),
            close_callback: RefCell::new(None),
            max_buffer_size: Cell::new(100 * 1024 * 1024),
            tls: Cell::new(false),
            certificate: RefCell::new(None),
        })
    }

    /// Delivers bytes from the peer.
    pub(crate) fn feed(&self, data: &[u8]) {
        if self.closed.get() {
            return;
        }
        self.read_buffer.borrow_mut().extend_from_slice(data);
        self.try_deliver();
    }

    /// Everything written to the stream so far.
    pub(crate) fn written(&self) -> Bytes {
        Bytes::copy_from_slice(&self.written.borrow())
    }

    /// Makes subsequent writes stay in flight until
    /// [`complete_writes`](MockStream::complete_writes).
    pub(crate) fn delay_writes(&self, enabled: bool) {
        self.delay.set(enabled);
    }

    /// Drains the in-flight writes, running their completion callbacks.
    pub(crate) fn complete_writes(&self) {
        self.writes_in_flight.set(0);
        loop {
            let callback = self.write_callbacks.borrow_mut().pop_front();
            match callback {
                Some(callback) => callback(),
                None => break,
            }
        }
    }

    pub(crate) fn has_pending_read(&self) -> bool {
        self.pending_read.borrow().is_some()
    }

    pub(crate) fn set_max_buffer_size(&self, max: usize) {
        self.max_buffer_size.set(max);
    }

    pub(crate) fn set_tls(&self, enabled: bool) {
        self.tls.set(enabled);
    }

    pub(crate) fn set_certificate(&self, certificate: Bytes) {
        *self.certificate.borrow_mut() = Some(certificate);
    }

    fn try_deliver(&self) {
        loop {
            if self.closed.get() {
                return;
            }
            let ready = {
                let mut pending = self.pending_read.borrow_mut();
                let mut buffer = self.read_buffer.borrow_mut();
                match pending.take() {
                    None => return,
                    Some(PendingRead::Until(delimiter, callback)) => {
                        match memmem::find(&buffer, delimiter) {
                            Some(at) => (callback, buffer.split_to(at + delimiter.len()).freeze()),
                            None => {
                                *pending = Some(PendingRead::Until(delimiter, callback));
                                return;
                            }
                        }
                    }
                    Some(PendingRead::Exactly(n, callback)) => {
                        if buffer.len() >= n {
                            (callback, buffer.split_to(n).freeze())
                        } else {
                            *pending = Some(PendingRead::Exactly(n, callback));
                            return;
                        }
                    }
                }
            };
            let (callback, data) = ready;
            callback(data);
        }
    }
}

impl Stream for MockStream {
    fn read_until(&self, delimiter: &'static [u8], callback: ReadCallback) {
        if self.closed.get() {
            return;
        }
        {
            let mut pending = self.pending_read.borrow_mut();
            assert!(pending.is_none(), "a read is already outstanding");
            *pending = Some(PendingRead::Until(delimiter, callback));
        }
        self.try_deliver();
    }

    fn read_exactly(&self, n: usize, callback: ReadCallback) {
        if self.closed.get() {
            return;
        }
        {
            let mut pending = self.pending_read.borrow_mut();
            assert!(pending.is_none(), "a read is already outstanding");
            *pending = Some(PendingRead::Exactly(n, callback));
        }
        self.try_deliver();
    }

    fn write(&self, chunk: Bytes, callback: Option<WriteCallback>) {
        if self.closed.get() {
            return;
        }
        self.written.borrow_mut().extend_from_slice(&chunk);
        if self.delay.get() {
            self.writes_in_flight.set(self.writes_in_flight.get() + 1);
            if let Some(callback) = callback {
                self.write_callbacks.borrow_mut().push_back(callback);
            }
        } else if let Some(callback) = callback {
            callback();
        }
    }

    fn set_close_callback(&self, callback: CloseCallback) {
        *self.close_callback.borrow_mut() = Some(callback);
    }

    fn close(&self) {
        if self.closed.get() {
            return;
        }
        self.closed.set(true);
        *self.pending_read.borrow_mut() = None;
        self.write_callbacks.borrow_mut().clear();
        self.writes_in_flight.set(0);
        let callback = self.close_callback.borrow_mut().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn closed(&self) -> bool {
        self.closed.get()
    }

    fn writing(&self) -> bool {
        self.writes_in_flight.get() > 0
    }

    fn max_buffer_size(&self) -> usize {
        self.max_buffer_size.get()
    }

    fn is_tls(&self) -> bool {
        self.tls.get()
    }

    fn peer_certificate(&self) -> Option<Bytes> {
        self.certificate.borrow().clone()
    }
}
