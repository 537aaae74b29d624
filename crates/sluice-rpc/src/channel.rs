use std::{
    cell::RefCell,
    fmt,
    net::SocketAddr,
    rc::{Rc, Weak},
};

use sluice_reactor::EventLoop;

use crate::{
    error::{Error, Result},
    stream::{Stream, StreamConfig, StreamSocket, WriteCallback},
};

/// Frame header length on the wire.
pub const HEADER_SIZE: usize = size_of::<i32>();
/// Connection-signature prefix length on IPC frames.
pub const SIGNATURE_SIZE: usize = 6;

/// Which logical channel a frame travels on. Encoded as the sign of the
/// header: positive for data, negative for control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Control,
}

/// 6-byte connection identity: packed IPv4 octets followed by the big-endian
/// port. Opaque routing key everywhere except construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    /// `None` for anything but an IPv4 peer; the wire format has no room for
    /// IPv6 addresses.
    pub fn from_addr(addr: &SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => {
                let mut id = [0; SIGNATURE_SIZE];
                id[..4].copy_from_slice(&v4.ip().octets());
                id[4..].copy_from_slice(&v4.port().to_be_bytes());
                Some(Self(id))
            }
            SocketAddr::V6(_) => None,
        }
    }

    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, hi, lo] = self.0;
        write!(f, "{a}.{b}.{c}.{d}:{}", u16::from_be_bytes([hi, lo]))
    }
}

fn encode_header(kind: FrameKind, len: usize) -> Result<[u8; HEADER_SIZE]> {
    if len == 0 {
        return Err(Error::InvalidFrame);
    }
    let len = i32::try_from(len).map_err(|_| Error::FrameTooLarge(len))?;
    let header = match kind {
        FrameKind::Data => len,
        FrameKind::Control => -len,
    };
    Ok(header.to_le_bytes())
}

pub type PayloadCallback = Box<dyn FnMut(&[u8]) -> Result<()>>;
pub type IpcPayloadCallback = Box<dyn FnMut(Signature, &[u8]) -> Result<()>>;

/// Length-prefixed message layer over a [`Stream`].
///
/// Inbound frames alternate a 4-byte signed little-endian header with a
/// payload of `|header|` bytes; the sign routes the payload to the data or
/// control handler. A zero header is invalid and closes the channel. A
/// missing handler for a received kind consumes the payload silently.
#[derive(Clone)]
pub struct NetworkChannel {
    inner: Rc<ChannelInner>,
}

struct ChannelInner {
    stream: Stream,
    data_handler: RefCell<Option<PayloadCallback>>,
    control_handler: RefCell<Option<PayloadCallback>>,
}

impl NetworkChannel {
    pub fn new(
        event_loop: &EventLoop,
        socket: impl StreamSocket + 'static,
        cfg: StreamConfig,
        label: impl Into<String>,
    ) -> Result<Self> {
        let stream = Stream::new(event_loop, socket, cfg, label)?;
        Ok(Self {
            inner: Rc::new(ChannelInner {
                stream,
                data_handler: RefCell::new(None),
                control_handler: RefCell::new(None),
            }),
        })
    }

    pub fn set_data_handler(&self, handler: impl FnMut(&[u8]) -> Result<()> + 'static) {
        *self.inner.data_handler.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_control_handler(&self, handler: impl FnMut(&[u8]) -> Result<()> + 'static) {
        *self.inner.control_handler.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_close_callback(&self, callback: impl FnOnce() + 'static) {
        self.inner.stream.set_close_callback(callback);
    }

    /// Begin the header/payload read cycle.
    pub fn start_read(&self) -> Result<()> {
        ChannelInner::queue_header_read(&self.inner)
    }

    /// Frame `payload` on the given kind. Without a completion callback the
    /// frame is flushed immediately rather than batched.
    pub fn write(
        &self,
        kind: FrameKind,
        payload: &[u8],
        callback: Option<WriteCallback>,
    ) -> Result<()> {
        let header = encode_header(kind, payload.len())?;
        self.inner.stream.write(&header, None)?;
        let flush = callback.is_none();
        self.inner.stream.write(payload, callback)?;
        if flush {
            self.inner.stream.flush()?;
        }
        Ok(())
    }

    pub fn close(&self) {
        self.inner.stream.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stream.is_closed()
    }
}

impl ChannelInner {
    fn queue_header_read(this: &Rc<Self>) -> Result<()> {
        let chan = Rc::clone(this);
        this.stream.read(HEADER_SIZE, move |buf| {
            let header = i32::from_le_bytes(buf.try_into().unwrap());
            if header == 0 {
                return Err(Error::InvalidFrame);
            }
            let kind = if header > 0 { FrameKind::Data } else { FrameKind::Control };
            Self::queue_payload_read(&chan, header.unsigned_abs() as usize, kind)
        })
    }

    fn queue_payload_read(this: &Rc<Self>, len: usize, kind: FrameKind) -> Result<()> {
        let chan = Rc::clone(this);
        this.stream.read(len, move |payload| {
            chan.dispatch(kind, payload)?;
            Self::queue_header_read(&chan)
        })
    }

    fn dispatch(&self, kind: FrameKind, payload: &[u8]) -> Result<()> {
        let slot = match kind {
            FrameKind::Data => &self.data_handler,
            FrameKind::Control => &self.control_handler,
        };
        let mut handler = slot.borrow_mut();
        match handler.as_mut() {
            Some(handler) => handler(payload),
            // No handler registered for this kind: consume and drop.
            None => Ok(()),
        }
    }
}

/// Channel variant spoken between the server and its worker processes.
///
/// Framing matches [`NetworkChannel`] except that every payload is prefixed
/// with the 6-byte signature of the client connection it belongs to, so
/// responses can be routed back without the worker understanding the key.
#[derive(Clone)]
pub struct IpcChannel {
    inner: Rc<IpcChannelInner>,
}

pub struct WeakIpcChannel {
    inner: Weak<IpcChannelInner>,
}

impl WeakIpcChannel {
    pub fn upgrade(&self) -> Option<IpcChannel> {
        self.inner.upgrade().map(|inner| IpcChannel { inner })
    }
}

struct IpcChannelInner {
    stream: Stream,
    data_handler: RefCell<Option<IpcPayloadCallback>>,
    control_handler: RefCell<Option<IpcPayloadCallback>>,
}

impl IpcChannel {
    pub fn new(
        event_loop: &EventLoop,
        socket: impl StreamSocket + 'static,
        cfg: StreamConfig,
        label: impl Into<String>,
    ) -> Result<Self> {
        let stream = Stream::new(event_loop, socket, cfg, label)?;
        Ok(Self {
            inner: Rc::new(IpcChannelInner {
                stream,
                data_handler: RefCell::new(None),
                control_handler: RefCell::new(None),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakIpcChannel {
        WeakIpcChannel { inner: Rc::downgrade(&self.inner) }
    }

    pub fn set_data_handler(&self, handler: impl FnMut(Signature, &[u8]) -> Result<()> + 'static) {
        *self.inner.data_handler.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_control_handler(
        &self,
        handler: impl FnMut(Signature, &[u8]) -> Result<()> + 'static,
    ) {
        *self.inner.control_handler.borrow_mut() = Some(Box::new(handler));
    }

    pub fn set_close_callback(&self, callback: impl FnOnce() + 'static) {
        self.inner.stream.set_close_callback(callback);
    }

    pub fn start_read(&self) -> Result<()> {
        IpcChannelInner::queue_header_read(&self.inner)
    }

    /// Emit header ‖ signature ‖ payload as three back-to-back stream writes;
    /// the header counts the signature bytes.
    pub fn write(
        &self,
        signature: Signature,
        payload: &[u8],
        callback: Option<WriteCallback>,
    ) -> Result<()> {
        let header = encode_header(FrameKind::Data, payload.len() + SIGNATURE_SIZE)?;
        self.inner.stream.write(&header, None)?;
        self.inner.stream.write(signature.as_bytes(), None)?;
        let flush = callback.is_none();
        self.inner.stream.write(payload, callback)?;
        if flush {
            self.inner.stream.flush()?;
        }
        Ok(())
    }

    pub fn close(&self) {
        self.inner.stream.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stream.is_closed()
    }
}

impl IpcChannelInner {
    fn queue_header_read(this: &Rc<Self>) -> Result<()> {
        let chan = Rc::clone(this);
        this.stream.read(HEADER_SIZE, move |buf| {
            let header = i32::from_le_bytes(buf.try_into().unwrap());
            if header == 0 {
                return Err(Error::InvalidFrame);
            }
            let len = header.unsigned_abs() as usize;
            if len < SIGNATURE_SIZE {
                return Err(Error::InvalidFrame);
            }
            let kind = if header > 0 { FrameKind::Data } else { FrameKind::Control };
            Self::queue_payload_read(&chan, len, kind)
        })
    }

    fn queue_payload_read(this: &Rc<Self>, len: usize, kind: FrameKind) -> Result<()> {
        let chan = Rc::clone(this);
        this.stream.read(len, move |framed| {
            let (prefix, payload) = framed.split_at(SIGNATURE_SIZE);
            let signature = Signature::from_bytes(prefix.try_into().unwrap());
            chan.dispatch(kind, signature, payload)?;
            Self::queue_header_read(&chan)
        })
    }

    fn dispatch(&self, kind: FrameKind, signature: Signature, payload: &[u8]) -> Result<()> {
        let slot = match kind {
            FrameKind::Data => &self.data_handler,
            FrameKind::Control => &self.control_handler,
        };
        let mut handler = slot.borrow_mut();
        match handler.as_mut() {
            Some(handler) => handler(signature, payload),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;

    #[test]
    fn signature_packs_octets_and_port() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8080));
        let signature = Signature::from_addr(&addr).expect("ipv4");
        assert_eq!(signature.as_bytes(), &[127, 0, 0, 1, 0x1f, 0x90]);
        assert_eq!(signature.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn signature_rejects_ipv6() {
        let addr: SocketAddr = "[::1]:9000".parse().expect("addr");
        assert!(Signature::from_addr(&addr).is_none());
    }

    #[test]
    fn header_sign_selects_kind() {
        assert_eq!(encode_header(FrameKind::Data, 10).expect("data"), 10i32.to_le_bytes());
        assert_eq!(encode_header(FrameKind::Control, 3).expect("control"), (-3i32).to_le_bytes());
    }

    #[test]
    fn header_rejects_empty_and_oversized_frames() {
        assert!(matches!(encode_header(FrameKind::Data, 0), Err(Error::InvalidFrame)));
        let too_big = i32::MAX as usize + 1;
        assert!(matches!(
            encode_header(FrameKind::Data, too_big),
            Err(Error::FrameTooLarge(n)) if n == too_big
        ));
    }
}
