use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io::{self, Read, Write},
    rc::Rc,
};

use mio::event::Source;
use sluice_reactor::{EventHandler, EventLoop, Ready, Token};
use tracing::{debug, warn};

use crate::{
    buffer::IoBuffer,
    error::{Error, Result},
};

/// Socket types a [`Stream`] can drive: non-blocking, pollable and
/// byte-oriented.
pub trait StreamSocket: Read + Write + Source {}

impl StreamSocket for mio::net::TcpStream {}
impl StreamSocket for mio::net::UnixStream {}

pub type ReadCallback = Box<dyn FnOnce(&[u8]) -> Result<()>>;
pub type WriteCallback = Box<dyn FnOnce() -> Result<()>>;
pub type CloseCallback = Box<dyn FnOnce()>;

/// Buffer sizing knobs for a [`Stream`].
#[derive(Clone, Copy, Debug)]
pub struct StreamConfig {
    /// Floor for either buffer allocation.
    pub min_buf_size: usize,
    /// Hard cap; exceeding it closes the stream.
    pub max_buf_size: usize,
    /// Bytes attempted per socket read, and the backlog above which buffered
    /// writes force WRITE interest on their own.
    pub io_chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_buf_size: 128 * 1024,
            max_buf_size: 16 * 1024 * 1024,
            io_chunk_size: 32 * 1024,
        }
    }
}

impl StreamConfig {
    pub fn with_min_buf_size(mut self, size: usize) -> Self {
        self.min_buf_size = size;
        self
    }

    pub fn with_max_buf_size(mut self, size: usize) -> Self {
        self.max_buf_size = size;
        self
    }

    pub fn with_io_chunk_size(mut self, size: usize) -> Self {
        self.io_chunk_size = size;
        self
    }
}

struct PendingRead {
    len: usize,
    callback: ReadCallback,
}

/// Fires once every byte up to `pos` (absolute write-buffer position) has
/// been handed to the kernel. A `None` callback is a flush marker: it keeps
/// WRITE interest armed with nothing to notify.
struct PendingWrite {
    pos: usize,
    callback: Option<WriteCallback>,
}

/// Buffered continuation-passing façade over a non-blocking socket.
///
/// Reads complete in FIFO order of [`read`](Self::read) calls once enough
/// bytes are buffered; write completions fire in FIFO order once their bytes
/// reach the kernel. Delivered slices are valid only for the duration of the
/// callback. A callback returning `Err` closes the stream before the error
/// surfaces, so a misbehaving continuation cannot leak the fd.
#[derive(Clone)]
pub struct Stream {
    inner: Rc<StreamInner>,
}

impl Stream {
    pub fn new(
        event_loop: &EventLoop,
        socket: impl StreamSocket + 'static,
        cfg: StreamConfig,
        label: impl Into<String>,
    ) -> Result<Self> {
        let token = event_loop.token();
        let inner = Rc::new(StreamInner {
            label: label.into(),
            token,
            event_loop: event_loop.clone(),
            cfg,
            socket: RefCell::new(Some(Box::new(socket))),
            read_buf: IoBuffer::new(cfg.min_buf_size),
            write_buf: IoBuffer::new(cfg.min_buf_size),
            read_queue: RefCell::new(VecDeque::new()),
            write_queue: RefCell::new(VecDeque::new()),
            close_callback: RefCell::new(None),
            mask: Cell::new(Ready::ERROR),
        });
        {
            let mut socket = inner.socket.borrow_mut();
            if let Some(sock) = socket.as_mut() {
                event_loop.add_handler(
                    sock.as_mut(),
                    token,
                    Rc::clone(&inner) as Rc<dyn EventHandler>,
                    Ready::ERROR,
                )?;
            }
        }
        Ok(Self { inner })
    }

    /// Call `callback` with exactly `n` bytes once they are available.
    ///
    /// Completes synchronously when the bytes are already buffered and no
    /// earlier read is pending.
    pub fn read(&self, n: usize, callback: impl FnOnce(&[u8]) -> Result<()> + 'static) -> Result<()> {
        self.inner.read(n, Box::new(callback))
    }

    /// Append `data` to the write buffer; `callback` (if any) fires once all
    /// bytes up to and including `data` have been handed to the kernel.
    ///
    /// Bytes are held back for batching until a completion is pending or the
    /// backlog exceeds `io_chunk_size`; use [`flush`](Self::flush) to force
    /// smaller writes out.
    pub fn write(&self, data: &[u8], callback: Option<WriteCallback>) -> Result<()> {
        self.inner.write(data, callback)
    }

    /// Arm WRITE interest for whatever is buffered, regardless of size.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    /// `callback` fires exactly once when the stream closes.
    pub fn set_close_callback(&self, callback: impl FnOnce() + 'static) {
        *self.inner.close_callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Idempotent. Releases the fd and discards pending read/write
    /// continuations without firing them, then fires the close callback.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

pub(crate) struct StreamInner {
    label: String,
    token: Token,
    event_loop: EventLoop,
    cfg: StreamConfig,
    socket: RefCell<Option<Box<dyn StreamSocket>>>,
    read_buf: IoBuffer,
    write_buf: IoBuffer,
    read_queue: RefCell<VecDeque<PendingRead>>,
    write_queue: RefCell<VecDeque<PendingWrite>>,
    close_callback: RefCell<Option<CloseCallback>>,
    /// Interest currently registered with the loop.
    mask: Cell<Ready>,
}

impl StreamInner {
    fn is_closed(&self) -> bool {
        self.socket.borrow().is_none()
    }

    fn read(&self, n: usize, callback: ReadCallback) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedStream);
        }
        if self.read_queue.borrow().is_empty() && self.read_buf.len() >= n {
            return self.consume_read(n, callback);
        }
        self.read_queue.borrow_mut().push_back(PendingRead { len: n, callback });
        self.add_io_state(Ready::READABLE)
    }

    fn write(&self, data: &[u8], callback: Option<WriteCallback>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedStream);
        }
        if self.write_buf.end() + data.len() >= self.write_buf.size() {
            let Some(shift) =
                self.write_buf.make_room(data.len(), self.cfg.min_buf_size, self.cfg.max_buf_size)
            else {
                let need = self.write_buf.len() + data.len();
                warn!(
                    stream = %self.label,
                    need,
                    cap = self.cfg.max_buf_size,
                    "stream: write buffer cap reached, closing"
                );
                self.close();
                return Err(Error::BufferOverflow { need, cap: self.cfg.max_buf_size });
            };
            if shift > 0 {
                for pending in self.write_queue.borrow_mut().iter_mut() {
                    pending.pos -= shift;
                }
            }
        }
        self.write_buf.fill(data);
        if let Some(callback) = callback {
            self.write_queue
                .borrow_mut()
                .push_back(PendingWrite { pos: self.write_buf.end(), callback: Some(callback) });
        }
        if !self.write_queue.borrow().is_empty() || self.write_buf.len() > self.cfg.io_chunk_size {
            self.add_io_state(Ready::WRITABLE)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedStream);
        }
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.write_queue
            .borrow_mut()
            .push_back(PendingWrite { pos: self.write_buf.end(), callback: None });
        self.add_io_state(Ready::WRITABLE)
    }

    fn close(&self) {
        let Some(mut socket) = self.socket.borrow_mut().take() else { return };
        self.event_loop.remove_handler(socket.as_mut(), self.token);
        drop(socket);
        self.read_queue.borrow_mut().clear();
        self.write_queue.borrow_mut().clear();
        if let Some(callback) = self.close_callback.borrow_mut().take() {
            callback();
        }
    }

    /// Pop `n` buffered bytes and hand them to `callback`.
    fn consume_read(&self, n: usize, callback: ReadCallback) -> Result<()> {
        let offset = self.read_buf.consume(n);
        let result = {
            let window = self.read_buf.window(offset, n);
            callback(&window)
        };
        self.check_callback(result)
    }

    fn check_callback(&self, result: Result<()>) -> Result<()> {
        if let Err(err) = result {
            warn!(stream = %self.label, %err, "stream: callback failed, closing");
            self.close();
            return Err(err);
        }
        Ok(())
    }

    fn add_io_state(&self, state: Ready) -> Result<()> {
        if self.mask.get().contains(state) {
            return Ok(());
        }
        let mask = self.mask.get() | state;
        self.mask.set(mask);
        let mut socket = self.socket.borrow_mut();
        if let Some(sock) = socket.as_mut() {
            self.event_loop.update_handler(sock.as_mut(), self.token, mask)?;
        }
        Ok(())
    }

    fn handle_read(&self) {
        // The poller is edge-triggered: drain until WouldBlock, never stop at
        // a short read. EOF defers the close until buffered bytes have been
        // offered to the pending continuations, so a peer that writes a
        // request and hangs up straight after still gets it processed.
        let mut peer_closed = false;
        loop {
            if self.read_buf.end() + self.cfg.io_chunk_size >= self.read_buf.size() {
                if self
                    .read_buf
                    .make_room(self.cfg.io_chunk_size, self.cfg.min_buf_size, self.cfg.max_buf_size)
                    .is_none()
                {
                    warn!(
                        stream = %self.label,
                        cap = self.cfg.max_buf_size,
                        "stream: read buffer cap reached, closing"
                    );
                    self.close();
                    return;
                }
            }
            let read = {
                let mut socket = self.socket.borrow_mut();
                let Some(sock) = socket.as_mut() else { return };
                self.read_buf.fill_from(sock.as_mut(), self.cfg.io_chunk_size)
            };
            match read {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(stream = %self.label, ?err, "stream: read failed, closing");
                    self.close();
                    return;
                }
            }
        }
        self.drain_read_queue();
        if peer_closed && !self.is_closed() {
            debug!(stream = %self.label, "stream: peer closed");
            self.close();
        }
    }

    fn drain_read_queue(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let pending = {
                let mut queue = self.read_queue.borrow_mut();
                match queue.front() {
                    Some(head) if head.len <= self.read_buf.len() => queue.pop_front(),
                    _ => None,
                }
            };
            let Some(pending) = pending else { return };
            if self.consume_read(pending.len, pending.callback).is_err() {
                // Stream is closed and the fault already logged.
                return;
            }
        }
    }

    fn handle_write(&self) {
        while !self.write_buf.is_empty() {
            let attempted = self.write_buf.len();
            let wrote = {
                let mut socket = self.socket.borrow_mut();
                let Some(sock) = socket.as_mut() else { return };
                self.write_buf.drain_into(sock.as_mut())
            };
            match wrote {
                Ok(0) => {
                    warn!(stream = %self.label, "stream: wrote zero bytes, closing");
                    self.close();
                    return;
                }
                Ok(n) if n == attempted => break,
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(stream = %self.label, ?err, "stream: write failed, closing");
                    self.close();
                    return;
                }
            }
        }
        self.drain_write_queue();
    }

    fn drain_write_queue(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let pending = {
                let mut queue = self.write_queue.borrow_mut();
                match queue.front() {
                    Some(head) if head.pos <= self.write_buf.start() => queue.pop_front(),
                    _ => None,
                }
            };
            let Some(pending) = pending else { return };
            if let Some(callback) = pending.callback {
                if self.check_callback(callback()).is_err() {
                    return;
                }
            }
        }
    }
}

impl EventHandler for StreamInner {
    fn handle_events(&self, _token: Token, ready: Ready) {
        if self.is_closed() {
            debug!(stream = %self.label, "stream: event on closed stream");
            return;
        }
        if ready.contains(Ready::READABLE) {
            self.handle_read();
            if self.is_closed() {
                return;
            }
        }
        if ready.contains(Ready::WRITABLE) {
            self.handle_write();
            if self.is_closed() {
                return;
            }
        }
        if ready.contains(Ready::ERROR) {
            debug!(stream = %self.label, "stream: error event, closing");
            self.close();
            return;
        }

        let mut mask = Ready::ERROR;
        if !self.read_queue.borrow().is_empty() {
            mask |= Ready::READABLE;
        }
        if !self.write_queue.borrow().is_empty()
            || self.write_buf.len() > self.cfg.io_chunk_size
        {
            mask |= Ready::WRITABLE;
        }
        if mask != self.mask.get() {
            self.mask.set(mask);
            let result = {
                let mut socket = self.socket.borrow_mut();
                match socket.as_mut() {
                    Some(sock) => self.event_loop.update_handler(sock.as_mut(), self.token, mask),
                    None => Ok(()),
                }
            };
            if let Err(err) = result {
                warn!(stream = %self.label, ?err, "stream: interest update failed, closing");
                self.close();
            }
        }
    }
}
