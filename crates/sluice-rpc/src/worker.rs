use std::os::unix::net::UnixStream as StdUnixStream;

use mio::net::UnixStream;
use sluice_reactor::EventLoop;
use tracing::debug;

use crate::{
    channel::{IpcChannel, Signature},
    error::Result,
    stream::StreamConfig,
};

/// Response context for one request, bound to the connection that carried
/// it. Opaque to the handler: replying never requires decoding the signature.
pub struct Reply<'a> {
    signature: Signature,
    channel: &'a IpcChannel,
}

impl Reply<'_> {
    /// Send `payload` back to the client this request came from.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.channel.write(self.signature, payload, None)
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }
}

/// Per-request entry point, executed inside a worker process.
///
/// Blanket-implemented for closures and fns of the matching shape. The
/// handler may compute for as long as it likes, but blocking indefinitely
/// stalls its worker's loop.
pub trait PayloadHandler {
    fn handle(&mut self, payload: &[u8], reply: Reply<'_>) -> Result<()>;
}

impl<F> PayloadHandler for F
where
    F: FnMut(&[u8], Reply<'_>) -> Result<()>,
{
    fn handle(&mut self, payload: &[u8], reply: Reply<'_>) -> Result<()> {
        self(payload, reply)
    }
}

/// Child-process half of the worker pool: one event loop, one IPC channel,
/// no state shared with the parent beyond the socket pair.
pub struct SocketWorker {
    event_loop: EventLoop,
    channel: IpcChannel,
}

impl SocketWorker {
    /// `cfg` should match the one the parent applied to its end of the
    /// socket pair, so both halves of the IPC stream share buffer caps.
    pub fn new<H>(socket: StdUnixStream, cfg: StreamConfig, handler: H) -> Result<Self>
    where
        H: PayloadHandler + 'static,
    {
        let event_loop = EventLoop::new()?;
        socket.set_nonblocking(true)?;
        let channel = IpcChannel::new(
            &event_loop,
            UnixStream::from_std(socket),
            cfg,
            format!("worker-{}", std::process::id()),
        )?;

        let weak = channel.downgrade();
        let mut handler = handler;
        channel.set_data_handler(move |signature, payload| {
            let Some(channel) = weak.upgrade() else { return Ok(()) };
            handler.handle(payload, Reply { signature, channel: &channel })
        });

        let loop_handle = event_loop.clone();
        channel.set_close_callback(move || {
            debug!("worker: ipc channel closed, stopping");
            loop_handle.stop();
        });

        Ok(Self { event_loop, channel })
    }

    /// Serve requests until the IPC channel closes. Blocks the process.
    pub fn run(&self) -> Result<()> {
        self.channel.start_read()?;
        self.event_loop.start()?;
        Ok(())
    }

    /// Halt the loop and close the channel. Idempotent.
    pub fn stop(&self) {
        self.event_loop.stop();
        self.channel.close();
    }
}
