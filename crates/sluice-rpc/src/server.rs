use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    os::unix::net::UnixStream as StdUnixStream,
    rc::{Rc, Weak},
};

use mio::net::{TcpListener, TcpStream, UnixStream};
use sluice_reactor::{EventHandler, EventLoop, Ready, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::{
    channel::{FrameKind, IpcChannel, NetworkChannel, Signature},
    error::{Error, Result},
    stream::StreamConfig,
    worker::{PayloadHandler, SocketWorker},
};

pub type WorkerId = usize;

#[derive(Clone, Copy, Debug)]
pub struct ServerConfig {
    /// Bind address; loopback by default.
    pub ip_addr: IpAddr,
    /// Bind port. Zero picks an ephemeral port.
    pub port: u16,
    /// Listen backlog.
    pub max_connection_num: u32,
    /// Forked worker processes.
    pub worker_num: usize,
    /// Buffer sizing applied to every stream the server creates.
    pub stream: StreamConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            max_connection_num: 1024,
            worker_num: 2 * num_cpus::get(),
            stream: StreamConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_ip_addr(mut self, ip_addr: IpAddr) -> Self {
        self.ip_addr = ip_addr;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_connection_num(mut self, backlog: u32) -> Self {
        self.max_connection_num = backlog;
        self
    }

    pub fn with_worker_num(mut self, worker_num: usize) -> Self {
        self.worker_num = worker_num;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }
}

/// Parent-side handle on a forked worker process.
pub struct WorkerProcess {
    pid: Option<libc::pid_t>,
}

impl WorkerProcess {
    fn new(pid: libc::pid_t) -> Self {
        Self { pid: Some(pid) }
    }

    /// Terminate the child and reap it. Idempotent.
    pub fn stop(&mut self) {
        let Some(pid) = self.pid.take() else { return };
        unsafe {
            libc::kill(pid, libc::SIGTERM);
            libc::waitpid(pid, std::ptr::null_mut(), 0);
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WorkerLink {
    channel: IpcChannel,
    process: WorkerProcess,
}

/// Accepts TCP connections and fans complete request payloads out to a pool
/// of forked worker processes, routing each response back to the connection
/// its request arrived on.
pub struct SocketServer {
    inner: Rc<ServerInner>,
}

impl SocketServer {
    /// Bind the listener, fork the worker pool and register with the loop.
    ///
    /// Forks happen here, so callers that need fork safety (tests, mostly)
    /// should bind before spawning any thread. Each worker owns a clone of
    /// `handler`.
    pub fn bind<H>(cfg: ServerConfig, event_loop: &EventLoop, handler: H) -> Result<Self>
    where
        H: PayloadHandler + Clone + 'static,
    {
        let listener = bind_listener(cfg.ip_addr, cfg.port, cfg.max_connection_num)?;
        let local_addr = listener.local_addr()?;
        let listener_token = event_loop.token();

        let inner = Rc::new_cyclic(|weak| ServerInner {
            event_loop: event_loop.clone(),
            cfg,
            listener: RefCell::new(Some(listener)),
            listener_token,
            net_channels: RefCell::new(HashMap::new()),
            workers: RefCell::new(HashMap::new()),
            rotation: RefCell::new(VecDeque::new()),
            weak: weak.clone(),
        });

        inner.spawn_workers(&handler)?;

        {
            let mut listener = inner.listener.borrow_mut();
            if let Some(listener) = listener.as_mut() {
                event_loop.add_handler(
                    listener,
                    listener_token,
                    Rc::clone(&inner) as Rc<dyn EventHandler>,
                    Ready::READABLE,
                )?;
            }
        }
        info!(addr = %local_addr, workers = cfg.worker_num, "server: listening");
        Ok(Self { inner })
    }

    /// Run the event loop until [`shutdown`](Self::shutdown). Blocking.
    pub fn start(&self) -> Result<()> {
        self.inner.event_loop.start()?;
        Ok(())
    }

    /// Kill the worker pool, drop every connection and stop the loop.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self.inner.listener.borrow().as_ref() {
            Some(listener) => Ok(listener.local_addr()?),
            None => Err(Error::ClosedStream),
        }
    }
}

struct ServerInner {
    event_loop: EventLoop,
    cfg: ServerConfig,
    listener: RefCell<Option<TcpListener>>,
    listener_token: Token,
    net_channels: RefCell<HashMap<Signature, NetworkChannel>>,
    workers: RefCell<HashMap<WorkerId, WorkerLink>>,
    /// Live worker ids, head-pop / tail-push.
    rotation: RefCell<VecDeque<WorkerId>>,
    weak: Weak<ServerInner>,
}

impl ServerInner {
    fn spawn_workers<H>(&self, handler: &H) -> Result<()>
    where
        H: PayloadHandler + Clone + 'static,
    {
        let mut pairs = Vec::with_capacity(self.cfg.worker_num);
        for _ in 0..self.cfg.worker_num {
            pairs.push(StdUnixStream::pair()?);
        }

        // Fork everything before wrapping any fd, so each child can drop the
        // whole set of pairs except its own end. Dropping `processes` on an
        // early return reaps whatever was already forked.
        let mut processes: Vec<WorkerProcess> = Vec::with_capacity(self.cfg.worker_num);
        for worker_id in 0..self.cfg.worker_num {
            match unsafe { libc::fork() } {
                -1 => return Err(Error::Io(io::Error::last_os_error())),
                0 => {
                    // Sibling pids belong to the parent; make sure no drop
                    // in this process can signal them.
                    for process in &mut processes {
                        process.pid = None;
                    }
                    let (parent_end, child_end) = pairs.swap_remove(worker_id);
                    drop(parent_end);
                    drop(pairs);
                    drop(self.listener.borrow_mut().take());
                    let code = match SocketWorker::new(child_end, self.cfg.stream, handler.clone()) {
                        Ok(worker) => match worker.run() {
                            Ok(()) => 0,
                            Err(err) => {
                                warn!(worker_id, %err, "worker: run failed");
                                1
                            }
                        },
                        Err(err) => {
                            warn!(worker_id, %err, "worker: setup failed");
                            1
                        }
                    };
                    std::process::exit(code);
                }
                pid => processes.push(WorkerProcess::new(pid)),
            }
        }

        for ((worker_id, (parent_end, child_end)), process) in
            pairs.into_iter().enumerate().zip(processes)
        {
            drop(child_end);
            self.install_worker(worker_id, process, parent_end)?;
        }
        Ok(())
    }

    fn install_worker(
        &self,
        worker_id: WorkerId,
        process: WorkerProcess,
        parent_end: StdUnixStream,
    ) -> Result<()> {
        parent_end.set_nonblocking(true)?;
        let channel = IpcChannel::new(
            &self.event_loop,
            UnixStream::from_std(parent_end),
            self.cfg.stream,
            format!("ipc-{worker_id}"),
        )?;

        let weak = self.weak.clone();
        channel.set_data_handler(move |signature, payload| {
            if let Some(server) = weak.upgrade() {
                server.dispatch_outbound(signature, payload);
            }
            Ok(())
        });
        let weak = self.weak.clone();
        channel.set_close_callback(move || {
            if let Some(server) = weak.upgrade() {
                server.destroy_worker(worker_id);
            }
        });
        channel.start_read()?;

        self.workers.borrow_mut().insert(worker_id, WorkerLink { channel, process });
        self.rotation.borrow_mut().push_back(worker_id);
        Ok(())
    }

    /// Forward a complete client payload to the next worker in rotation.
    fn dispatch_inbound(&self, signature: Signature, payload: &[u8]) {
        let worker_id = {
            let mut rotation = self.rotation.borrow_mut();
            match rotation.pop_front() {
                Some(id) => {
                    rotation.push_back(id);
                    id
                }
                None => {
                    warn!(client = %signature, "server: no live workers, dropping request");
                    return;
                }
            }
        };
        let channel = self.workers.borrow().get(&worker_id).map(|link| link.channel.clone());
        let Some(channel) = channel else { return };
        if let Err(err) = channel.write(signature, payload, None) {
            // The channel closes itself on overflow and its close callback
            // tears the worker down.
            warn!(worker_id, %err, "server: ipc write failed");
        }
    }

    /// Route a worker response back to the originating connection. A missing
    /// mapping means the client already disconnected; the response is
    /// dropped.
    fn dispatch_outbound(&self, signature: Signature, payload: &[u8]) {
        let channel = self.net_channels.borrow().get(&signature).cloned();
        let Some(channel) = channel else {
            debug!(client = %signature, "server: client gone, dropping response");
            return;
        };
        if let Err(err) = channel.write(FrameKind::Data, payload, None) {
            warn!(client = %signature, %err, "server: response write failed");
        }
    }

    fn close_net_channel(&self, signature: Signature) {
        let mut channels = self.net_channels.borrow_mut();
        // Only evict the closed channel: a reconnect reusing the signature
        // may already have replaced this entry.
        if channels.get(&signature).is_some_and(NetworkChannel::is_closed) {
            channels.remove(&signature);
        }
    }

    fn destroy_worker(&self, worker_id: WorkerId) {
        self.rotation.borrow_mut().retain(|id| *id != worker_id);
        let link = self.workers.borrow_mut().remove(&worker_id);
        let Some(mut link) = link else { return };
        debug!(worker_id, "server: destroying worker");
        link.process.stop();
        // Re-entrant close callback finds the map entry already gone.
        link.channel.close();
    }

    fn accept_ready(&self) {
        loop {
            let accepted = {
                let listener = self.listener.borrow();
                let Some(listener) = listener.as_ref() else { return };
                listener.accept()
            };
            match accepted {
                Ok((socket, addr)) => self.install_client(socket, addr),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(?err, "server: accept failed");
                    return;
                }
            }
        }
    }

    fn install_client(&self, socket: TcpStream, addr: SocketAddr) {
        let Some(signature) = Signature::from_addr(&addr) else {
            warn!(%addr, "server: non-IPv4 peer, dropping");
            return;
        };
        debug!(client = %signature, "server: client connected");
        let channel = match NetworkChannel::new(
            &self.event_loop,
            socket,
            self.cfg.stream,
            format!("net-{signature}"),
        ) {
            Ok(channel) => channel,
            Err(err) => {
                warn!(client = %signature, %err, "server: channel setup failed");
                return;
            }
        };

        let weak = self.weak.clone();
        channel.set_data_handler(move |payload| {
            if let Some(server) = weak.upgrade() {
                server.dispatch_inbound(signature, payload);
            }
            Ok(())
        });
        let weak = self.weak.clone();
        channel.set_close_callback(move || {
            if let Some(server) = weak.upgrade() {
                server.close_net_channel(signature);
            }
        });

        if let Err(err) = channel.start_read() {
            warn!(client = %signature, %err, "server: start read failed");
            channel.close();
            return;
        }
        let stale = self.net_channels.borrow_mut().insert(signature, channel);
        if let Some(stale) = stale {
            stale.close();
        }
    }

    fn shutdown(&self) {
        info!("server: shutting down");
        let ids: Vec<WorkerId> = self.workers.borrow().keys().copied().collect();
        for worker_id in ids {
            self.destroy_worker(worker_id);
        }
        let channels: Vec<NetworkChannel> = self.net_channels.borrow().values().cloned().collect();
        for channel in channels {
            channel.close();
        }
        if let Some(mut listener) = self.listener.borrow_mut().take() {
            self.event_loop.remove_handler(&mut listener, self.listener_token);
        }
        self.event_loop.stop();
    }
}

impl EventHandler for ServerInner {
    fn handle_events(&self, token: Token, ready: Ready) {
        if token != self.listener_token {
            return;
        }
        if ready.contains(Ready::ERROR) {
            warn!("server: listener error event");
        }
        if ready.contains(Ready::READABLE) {
            self.accept_ready();
        }
    }
}

fn bind_listener(ip: IpAddr, port: u16, backlog: u32) -> io::Result<TcpListener> {
    let addr = SocketAddr::new(ip, port);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(TcpListener::from_std(socket.into()))
}
