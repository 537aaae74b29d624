//! Single-threaded readiness loop over `mio::Poll`.
//!
//! Handlers are registered per token and invoked to completion, one at a
//! time, whenever their file descriptor reports readiness. The loop is
//! cooperative: handlers must not block, and all continuations they arm run
//! on a later dispatch pass of the same loop.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    rc::Rc,
    time::Duration,
};

use bitflags::bitflags;
use mio::{Events, Interest, Poll, event::Source};
use tracing::debug;

pub use mio::Token;

bitflags! {
    /// Readiness interest set for a registered handler.
    ///
    /// `ERROR` is always delivered when the OS reports it; requesting it
    /// alone keeps the handler in the loop's table without polling the fd.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Ready: u8 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
        const ERROR = 0b100;
    }
}

/// Invoked by the loop with the events that fired for a registered token.
pub trait EventHandler {
    fn handle_events(&self, token: Token, ready: Ready);
}

struct Registration {
    handler: Rc<dyn EventHandler>,
    /// Whether the fd is currently registered with the poller. A mask with
    /// neither READABLE nor WRITABLE leaves the entry in the table but takes
    /// the fd out of the poll set.
    armed: bool,
}

struct LoopInner {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    registrations: RefCell<HashMap<Token, Registration>>,
    next_token: Cell<usize>,
    running: Cell<bool>,
}

/// Cheaply cloneable handle on a single-threaded event loop.
///
/// All registration and dispatch happens on the thread that owns the loop;
/// handlers may re-enter the loop to update interest or register new fds
/// while a dispatch pass is in flight.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inner: Rc::new(LoopInner {
                poll: RefCell::new(Poll::new()?),
                events: RefCell::new(Events::with_capacity(256)),
                registrations: RefCell::new(HashMap::new()),
                next_token: Cell::new(0),
                running: Cell::new(false),
            }),
        })
    }

    /// Allocate a fresh registration token. Tokens are never reused, so a
    /// stale event can only ever miss its handler, not hit a new one.
    pub fn token(&self) -> Token {
        let token = self.inner.next_token.get();
        self.inner.next_token.set(token + 1);
        Token(token)
    }

    pub fn add_handler(
        &self,
        source: &mut dyn Source,
        token: Token,
        handler: Rc<dyn EventHandler>,
        mask: Ready,
    ) -> io::Result<()> {
        let armed = match interests(mask) {
            Some(interest) => {
                self.inner.poll.borrow().registry().register(source, token, interest)?;
                true
            }
            None => false,
        };
        self.inner.registrations.borrow_mut().insert(token, Registration { handler, armed });
        Ok(())
    }

    pub fn update_handler(
        &self,
        source: &mut dyn Source,
        token: Token,
        mask: Ready,
    ) -> io::Result<()> {
        let mut registrations = self.inner.registrations.borrow_mut();
        let Some(registration) = registrations.get_mut(&token) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "token has no handler"));
        };
        let poll = self.inner.poll.borrow();
        match (interests(mask), registration.armed) {
            (Some(interest), true) => poll.registry().reregister(source, token, interest)?,
            (Some(interest), false) => {
                poll.registry().register(source, token, interest)?;
                registration.armed = true;
            }
            (None, true) => {
                poll.registry().deregister(source)?;
                registration.armed = false;
            }
            (None, false) => {}
        }
        Ok(())
    }

    /// Drop a registration; the handler is not invoked again.
    pub fn remove_handler(&self, source: &mut dyn Source, token: Token) {
        let Some(registration) = self.inner.registrations.borrow_mut().remove(&token) else {
            return;
        };
        if registration.armed {
            if let Err(err) = self.inner.poll.borrow().registry().deregister(source) {
                debug!(?token, ?err, "reactor: deregister failed");
            }
        }
    }

    /// One poll-and-dispatch pass. Returns whether any events were handled.
    pub fn poll_once(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let mut fired: Vec<(Token, Ready)> = Vec::new();
        {
            let mut events = self.inner.events.borrow_mut();
            let mut poll = self.inner.poll.borrow_mut();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(false),
                Err(err) => return Err(err),
            }
            for event in events.iter() {
                let mut ready = Ready::empty();
                if event.is_readable() || event.is_read_closed() {
                    ready |= Ready::READABLE;
                }
                if event.is_writable() || event.is_write_closed() {
                    ready |= Ready::WRITABLE;
                }
                if event.is_error() {
                    ready |= Ready::ERROR;
                }
                if !ready.is_empty() {
                    fired.push((event.token(), ready));
                }
            }
        }

        let handled = !fired.is_empty();
        for (token, ready) in fired {
            // Clone the handler out of the table so it can re-enter the loop.
            let handler =
                self.inner.registrations.borrow().get(&token).map(|r| Rc::clone(&r.handler));
            match handler {
                Some(handler) => handler.handle_events(token, ready),
                // A handler earlier in this batch may have closed this one.
                None => debug!(?token, "reactor: event for unregistered token"),
            }
        }
        Ok(handled)
    }

    /// Dispatch until [`stop`](Self::stop) is called from a handler.
    pub fn start(&self) -> io::Result<()> {
        self.inner.running.set(true);
        while self.inner.running.get() {
            self.poll_once(None)?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.running.set(false);
    }
}

fn interests(mask: Ready) -> Option<Interest> {
    match (mask.contains(Ready::READABLE), mask.contains(Ready::WRITABLE)) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, os::unix::net::UnixStream as StdUnixStream};

    use super::*;

    struct Recorder {
        seen: Cell<Ready>,
    }

    impl EventHandler for Recorder {
        fn handle_events(&self, _token: Token, ready: Ready) {
            self.seen.set(self.seen.get() | ready);
        }
    }

    #[test]
    fn dispatches_readable_events() {
        let event_loop = EventLoop::new().expect("loop");
        let (a, mut b) = StdUnixStream::pair().expect("socketpair");
        a.set_nonblocking(true).expect("nonblocking");
        let mut source = mio::net::UnixStream::from_std(a);

        let token = event_loop.token();
        let recorder = Rc::new(Recorder { seen: Cell::new(Ready::empty()) });
        event_loop
            .add_handler(&mut source, token, Rc::clone(&recorder) as Rc<dyn EventHandler>, Ready::READABLE)
            .expect("add");

        b.write_all(b"ping").expect("write");
        while !recorder.seen.get().contains(Ready::READABLE) {
            event_loop.poll_once(Some(Duration::from_millis(10))).expect("poll");
        }

        event_loop.remove_handler(&mut source, token);
    }

    #[test]
    fn error_only_mask_leaves_fd_unpolled() {
        let event_loop = EventLoop::new().expect("loop");
        let (a, mut b) = StdUnixStream::pair().expect("socketpair");
        a.set_nonblocking(true).expect("nonblocking");
        let mut source = mio::net::UnixStream::from_std(a);

        let token = event_loop.token();
        let recorder = Rc::new(Recorder { seen: Cell::new(Ready::empty()) });
        event_loop
            .add_handler(&mut source, token, Rc::clone(&recorder) as Rc<dyn EventHandler>, Ready::ERROR)
            .expect("add");

        b.write_all(b"ping").expect("write");
        event_loop.poll_once(Some(Duration::from_millis(50))).expect("poll");
        assert_eq!(recorder.seen.get(), Ready::empty());

        // Arming READABLE picks up the already-buffered bytes.
        event_loop.update_handler(&mut source, token, Ready::READABLE | Ready::ERROR).expect("update");
        while !recorder.seen.get().contains(Ready::READABLE) {
            event_loop.poll_once(Some(Duration::from_millis(10))).expect("poll");
        }
    }

    #[test]
    fn removed_handler_is_not_invoked() {
        let event_loop = EventLoop::new().expect("loop");
        let (a, mut b) = StdUnixStream::pair().expect("socketpair");
        a.set_nonblocking(true).expect("nonblocking");
        let mut source = mio::net::UnixStream::from_std(a);

        let token = event_loop.token();
        let recorder = Rc::new(Recorder { seen: Cell::new(Ready::empty()) });
        event_loop
            .add_handler(&mut source, token, Rc::clone(&recorder) as Rc<dyn EventHandler>, Ready::READABLE)
            .expect("add");
        event_loop.remove_handler(&mut source, token);

        b.write_all(b"ping").expect("write");
        event_loop.poll_once(Some(Duration::from_millis(50))).expect("poll");
        assert_eq!(recorder.seen.get(), Ready::empty());
    }
}
