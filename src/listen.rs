//! Listening descriptors and the accept path.
//!
//! Listening sockets are opened by the supervisor before any worker is
//! forked, so every worker process inherits the same descriptors. Each
//! execution unit wraps them in its own pool while it holds the accept
//! lock; the accept handler drains `accept4` until would-block and admits
//! every new descriptor into the accepting unit's pool.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::thread::sleep;
use std::time::Duration;

use log::{debug, error, warn};
use socket2::{Domain, Socket, Type};

use crate::config::Config;
use crate::event::{Direction, HandlerFn, Token};
use crate::reactor::RegisterOption;
use crate::worker::Worker;

/// Bind/listen attempts before giving up on an in-use address.
const BIND_TRIES: u32 = 5;
/// Pause between bind attempts.
const BIND_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A bound, listening socket plus the handler for its connections.
#[derive(Debug)]
pub struct Listener {
    addr: SocketAddr,
    socket: Option<Socket>,
    conn_handler: HandlerFn,
}

impl Listener {
    /// Describe a listening address; the socket is created by
    /// [`open_all`]. `conn_handler` is installed on every connection
    /// accepted from this listener.
    pub fn new(addr: SocketAddr, conn_handler: HandlerFn) -> Listener {
        Listener {
            addr,
            socket: None,
            conn_handler,
        }
    }

    /// The configured address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The bound address, once open. Differs from [`addr`] when binding to
    /// port zero.
    ///
    /// [`addr`]: Listener::addr
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let socket = self.socket.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "listener is not open")
        })?;
        socket.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "listener has no inet address")
        })
    }

    /// The listening descriptor, or -1 before [`open_all`].
    pub fn fd(&self) -> RawFd {
        self.socket.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    /// Handler installed on accepted connections.
    pub fn conn_handler(&self) -> HandlerFn {
        self.conn_handler
    }

    fn open(&mut self, config: &Config) -> io::Result<()> {
        if self.socket.is_some() {
            warn!("listener {} is already open", self.addr);
            return Ok(());
        }

        let socket = Socket::new(Domain::for_address(self.addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        if let Err(err) = socket.set_recv_buffer_size(config.rcvbuf) {
            warn!("SO_RCVBUF on {} failed, ignored: {}", self.addr, err);
        }
        if let Err(err) = socket.set_send_buffer_size(config.sndbuf) {
            warn!("SO_SNDBUF on {} failed, ignored: {}", self.addr, err);
        }
        socket.set_nonblocking(true)?;
        socket.bind(&self.addr.into())?;
        socket.listen(config.backlog)?;

        debug!(
            "listening on {} (fd {})",
            self.addr,
            socket.as_raw_fd()
        );
        self.socket = Some(socket);
        Ok(())
    }
}

/// Open every listener, retrying addresses still held by a previous
/// process instance.
pub fn open_all(listeners: &mut [Listener], config: &Config) -> io::Result<()> {
    for attempt in (0..BIND_TRIES).rev() {
        let mut in_use = None;
        for listener in listeners.iter_mut() {
            if listener.socket.is_some() {
                continue;
            }
            match listener.open(config) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::AddrInUse && attempt > 0 => {
                    warn!("{} in use, retrying in 500ms", listener.addr);
                    in_use = Some(listener.addr);
                }
                Err(err) => {
                    error!("opening listener {} failed: {}", listener.addr, err);
                    return Err(err);
                }
            }
        }
        match in_use {
            None => return Ok(()),
            Some(_) => sleep(BIND_RETRY_DELAY),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "listening socket bind failed",
    ))
}

/// Read handler for listening descriptors: drain pending connections and
/// admit each into the accepting unit's pool.
pub(crate) fn accept_handler(worker: &mut Worker, token: Token, _direction: Direction) {
    let (listen_fd, listener_index) = match worker.pool.get_mut(token) {
        Some(conn) => {
            conn.read.ready = false;
            match conn.listener {
                Some(index) => (conn.fd(), index),
                None => return,
            }
        }
        None => return,
    };

    loop {
        let fd = unsafe {
            libc::accept4(
                listen_fd,
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd == -1 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return,
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::ConnectionAborted => continue,
                _ => {
                    if err.raw_os_error() == Some(libc::EMFILE)
                        || err.raw_os_error() == Some(libc::ENFILE)
                    {
                        // Descriptor-table exhaustion is fatal to the unit.
                        error!("accept: descriptor table exhausted: {}", err);
                        worker.fail(err);
                    } else {
                        error!("accept on fd {} failed: {}", listen_fd, err);
                    }
                    return;
                }
            }
        }

        let admitted = match worker.pool.admit(fd) {
            Ok(admitted) => admitted,
            Err(err) => {
                error!("admitting accepted fd {} failed: {}", fd, err);
                if unsafe { libc::close(fd) } == -1 {
                    error!(
                        "closing rejected fd {} failed: {}",
                        fd,
                        io::Error::last_os_error()
                    );
                }
                worker.fail(err);
                return;
            }
        };

        let handler = worker.shared.listeners[listener_index].conn_handler();
        if let Some(conn) = worker.pool.get_mut(admitted) {
            conn.set_handler(handler);
            conn.listener = Some(listener_index);
        }
        if let Err(err) = worker.register_conn(admitted, RegisterOption::Edge) {
            error!("registering accepted fd {} failed: {}", fd, err);
            worker.close_conn(admitted);
        }
    }
}
