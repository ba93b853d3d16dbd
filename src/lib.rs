//! Concurrency and process-supervision core for a distributed-storage
//! datanode server.
//!
//! The crate provides the machinery between the OS and a datanode's
//! request handling: a readiness-event [`Reactor`] over epoll, a
//! deadline-ordered [`TimerTree`], the cross-process [`AcceptLock`] that
//! serializes new-connection handling, a master/worker [`Supervisor`] with
//! a fixed-record control [`channel`] into every worker, and the
//! [`Notifier`] bridging async-disk-I/O completions back into an event
//! loop.
//!
//! # Architecture
//!
//! The [`Supervisor`] forks worker processes; each worker hosts several
//! execution units ([`Worker`]), one thread each, every one owning its own
//! reactor, timer tree and connection pool; per-unit state is never
//! shared and never locked. The only cross-unit state is the accept lock
//! (a CAS word in a mapping shared across the forked processes), the
//! supervisor's slot table and the notifier atomics.
//!
//! Every unit runs the same cycle: compete for the accept lock, poll for
//! readiness bounded by the nearest timer deadline, drain deferred accept
//! events before general events, release the lock, and expire timers once
//! wall-clock time has advanced.
//!
//! Block storage, the client wire protocol and namenode registration are
//! out of scope; they plug in through connection handlers, the
//! per-connection application state and the notifier.
//!
//! # Example
//!
//! A single execution unit accepting connections in the current process:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use datanode_core::{
//!     open_listeners, Config, Direction, Listener, Registry, Token,
//!     UnitKind, Worker, WorkerShared,
//! };
//!
//! fn on_client(worker: &mut Worker, token: Token, _direction: Direction) {
//!     // Request handling lives outside this crate.
//!     worker.close_conn(token);
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let config = Config::default();
//!     let mut listeners = vec![Listener::new("127.0.0.1:8090".parse().unwrap(), on_client)];
//!     open_listeners(&mut listeners, &config)?;
//!
//!     let shared = Arc::new(WorkerShared::new(config, listeners)?);
//!     let mut unit = Worker::new(0, UnitKind::Io, shared)?;
//!     let registry = Registry::new();
//!     registry.add_total(1);
//!     unit.run(&registry);
//!     Ok(())
//! }
//! ```

#![warn(anonymous_parameters,
        bare_trait_objects,
        missing_debug_implementations,
        missing_docs,
        trivial_casts,
        trivial_numeric_casts,
        unused_extern_crates,
        unused_import_braces,
        unused_qualifications,
        variant_size_differences,
)]

// Disallow warnings when running tests.
#![cfg_attr(test, deny(warnings))]

pub mod accept;
pub mod channel;
pub mod config;
pub mod conn;
pub mod event;
pub mod listen;
pub mod notify;
pub mod process;
pub mod reactor;
pub mod signal;
pub mod time;
pub mod timer;
pub mod worker;

pub use crate::accept::{AcceptLock, UnitId};
pub use crate::config::Config;
pub use crate::conn::{ConnPool, Connection};
pub use crate::event::{Direction, Event, Firing, HandlerFn, Token};
pub use crate::listen::{open_all as open_listeners, Listener};
pub use crate::notify::{Notifier, NotifyHandle};
pub use crate::process::{
    worker_process_cycle, ProcessControl, Supervisor, WorkerProcessContext,
};
pub use crate::reactor::{DispatchMode, Reactor, RegisterOption};
pub use crate::signal::Signal;
pub use crate::time::Clock;
pub use crate::timer::TimerTree;
pub use crate::worker::{Registry, UnitKind, UnitState, Worker, WorkerShared};
