//! Experimental asynchronous RPC server core.
//!
//! [`Stream`] is a buffered, continuation-passing façade over a non-blocking
//! socket, driven by a [`sluice_reactor::EventLoop`]. [`NetworkChannel`] and
//! [`IpcChannel`] frame it with a signed length header that demultiplexes
//! data from control messages. [`SocketServer`] accepts connections in the
//! parent process and round-robins complete request payloads over socket-pair
//! IPC to forked [`SocketWorker`] processes, routing each response back to
//! the connection its request arrived on.

mod buffer;
mod channel;
mod error;
mod server;
mod stream;
mod worker;

pub use channel::{
    FrameKind, HEADER_SIZE, IpcChannel, NetworkChannel, SIGNATURE_SIZE, Signature,
    WeakIpcChannel,
};
pub use error::{Error, Result};
pub use server::{ServerConfig, SocketServer, WorkerId, WorkerProcess};
pub use stream::{Stream, StreamConfig, StreamSocket, WriteCallback};
pub use worker::{PayloadHandler, Reply, SocketWorker};
