//! The event loop: many connections, one `poll(2)`.

use std::cell::{Cell, RefCell};
use std::io;

use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::continuation::{ConnectionId, Continuation};
use crate::dispatch;
use crate::error::*;
use crate::value::HostValue;
use crate::watch::{WatchFlags, WatchId};

pub(crate) trait IsMinusOne {
    fn is_minus_one(&self) -> bool;
}

macro_rules! impl_is_minus_one {
    ($($t:ident)*) => ($(impl IsMinusOne for $t {
        fn is_minus_one(&self) -> bool {
            *self == -1
        }
    })*)
}

impl_is_minus_one! { i8 i16 i32 i64 isize }

pub(crate) fn cvt<T: IsMinusOne>(t: T) -> io::Result<T> {
    if t.is_minus_one() {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}

/// `poll(2)`, retried on `EINTR`. Returns the number of ready descriptors.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout: i32) -> Result<usize> {
    loop {
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        match cvt(ret) {
            Ok(n) => return Ok(n as usize),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let msg = format!("Error polling DBus: {}", e);
                return Err(context!(e, ErrorKind::Transport(msg)));
            }
        }
    }
}

/// `LoopConfig` specifies the configuration parameters of an [`EventLoop`]
///
/// Examples:
///
/// ```rust
/// let c = simpledbus::LoopConfig::default();
/// assert_eq!(c.pump_timeout, 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    /// Timeout in milliseconds of the waits in the initial pump phase. The
    /// phase ends with the first wait that sees no traffic.
    pub pump_timeout: i32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig { pump_timeout: 0 }
    }
}

enum Stop {
    Requested(Vec<HostValue>),
    Failed(Error),
}

/// The descriptors of one wait and which connection's watch each belongs to.
#[derive(Default)]
struct WaitSet {
    fds: Vec<libc::pollfd>,
    owners: Vec<(usize, WatchId)>,
    /// Built for another slice of connections.
    stale: bool,
}

impl WaitSet {
    fn rebuild(&mut self, connections: &mut [Connection]) {
        self.fds.clear();
        self.owners.clear();
        for (index, connection) in connections.iter_mut().enumerate() {
            for watch in connection.watches().enabled() {
                self.fds.push(libc::pollfd {
                    fd: watch.fd,
                    events: watch.flags.to_poll_events(),
                    revents: 0,
                });
                self.owners.push((index, watch.id));
            }
            connection.watches_mut().clean();
        }
        self.stale = false;
        trace!(fds = self.fds.len(), "wait set rebuilt");
    }

    fn ready(&self) -> Vec<(usize, WatchId, WatchFlags)> {
        self.fds
            .iter()
            .zip(&self.owners)
            .filter(|(fd, _)| fd.revents != 0)
            .map(|(fd, (index, id))| (*index, *id, WatchFlags::from_poll_revents(fd.revents)))
            .collect()
    }
}

/// Drives a slice of [`Connection`]s.
///
/// An `EventLoop` runs at most once at a time; continuations reach it through
/// their [`Context`](crate::Context) to stop it.
pub struct EventLoop {
    config: LoopConfig,
    running: Cell<bool>,
    stop: RefCell<Option<Stop>>,
    wait_set: RefCell<WaitSet>,
}

/// Clears the running flag when a run ends, however it ends.
struct Running<'a>(&'a EventLoop);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.running.set(false);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        EventLoop::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        EventLoop::with_config(LoopConfig::default())
    }

    pub fn with_config(config: LoopConfig) -> Self {
        EventLoop {
            config,
            running: Cell::new(false),
            stop: RefCell::new(None),
            wait_set: RefCell::new(WaitSet::default()),
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Number of descriptors in the current wait set.
    pub fn watched_fds(&self) -> usize {
        self.wait_set.borrow().fds.len()
    }

    fn enter(&self, connections: &[Connection]) -> Result<Running<'_>> {
        if self.running.get() {
            return Err(context!(ErrorKind::LoopRunning));
        }
        if connections.is_empty() {
            return Err(context!(ErrorKind::NoConnections));
        }
        self.running.set(true);
        *self.stop.borrow_mut() = None;
        self.wait_set.borrow_mut().stale = true;
        Ok(Running(self))
    }

    /// Run until stopped.
    ///
    /// First pumps: drains and waits with the configured pump timeout until
    /// a wait sees no traffic. Then starts `entry`, if given, as connection
    /// 0's continuation, and waits without timeout from there on.
    ///
    /// Returns the values passed to [`stop`](EventLoop::stop), or the error
    /// that ended the run.
    pub fn run(
        &self,
        connections: &mut [Connection],
        entry: Option<Box<dyn Continuation>>,
    ) -> Result<Vec<HostValue>> {
        let _running = self.enter(connections)?;
        debug!(connections = connections.len(), "main loop started");

        loop {
            self.drain(connections);
            if self.stopping() {
                return self.finish();
            }
            if self.wait(connections, self.config.pump_timeout)? == 0 {
                break;
            }
        }

        if let Some(entry) = entry {
            dispatch::run(self, connections, ConnectionId(0), entry, Vec::new(), None);
        }

        loop {
            self.drain(connections);
            if self.stopping() {
                return self.finish();
            }
            self.wait(connections, -1)?;
        }
    }

    /// One pass without blocking: drain, wait with a zero timeout, drain.
    pub fn poll_once(&self, connections: &mut [Connection]) -> Result<()> {
        let _running = self.enter(connections)?;

        self.drain(connections);
        if !self.stopping() {
            self.wait(connections, 0)?;
            self.drain(connections);
        }

        match self.stop.borrow_mut().take() {
            Some(Stop::Failed(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Stop the running loop once the message at hand is dealt with; `run`
    /// returns `values`, or `[true]` if they are empty.
    pub fn stop(&self, values: Vec<HostValue>) -> Result<()> {
        if !self.running.get() {
            return Err(context!(ErrorKind::LoopNotRunning));
        }
        let values = if values.is_empty() {
            vec![HostValue::Bool(true)]
        } else {
            values
        };

        let mut stop = self.stop.borrow_mut();
        if !matches!(*stop, Some(Stop::Failed(_))) {
            *stop = Some(Stop::Requested(values));
        }
        Ok(())
    }

    /// Stop the loop with an error. Only the first error of a run is kept.
    pub(crate) fn fail(&self, err: Error) {
        let mut stop = self.stop.borrow_mut();
        match *stop {
            Some(Stop::Failed(_)) => {
                warn!(error = %err, "dropping error, loop already failed");
            }
            _ => {
                warn!(error = %err, "stopping main loop");
                *stop = Some(Stop::Failed(err));
            }
        }
    }

    fn stopping(&self) -> bool {
        self.stop.borrow().is_some()
    }

    fn finish(&self) -> Result<Vec<HostValue>> {
        let stop = self.stop.borrow_mut().take();
        debug!("main loop stopped");
        match stop {
            Some(Stop::Failed(e)) => Err(e),
            Some(Stop::Requested(values)) => Ok(values),
            None => Ok(vec![HostValue::Bool(true)]),
        }
    }

    fn drain(&self, connections: &mut [Connection]) {
        for index in 0..connections.len() {
            dispatch::drain(self, connections, index);
        }
    }

    /// Wait for readiness and let the transports do their I/O. Returns the
    /// number of ready descriptors.
    fn wait(&self, connections: &mut [Connection], timeout: i32) -> Result<usize> {
        let ready = {
            let mut wait_set = self.wait_set.borrow_mut();
            if wait_set.stale || connections.iter().any(|c| c.watches().is_dirty()) {
                wait_set.rebuild(connections);
            }
            if wait_set.fds.is_empty() {
                if timeout < 0 {
                    return Err(context!(ErrorKind::Disconnected));
                }
                return Ok(0);
            }
            if poll(&mut wait_set.fds, timeout)? == 0 {
                return Ok(0);
            }
            wait_set.ready()
        };

        for &(index, id, flags) in &ready {
            trace!(connection = index, watch = id.0, ?flags, "ready");
            if let Err(e) = connections[index].handle_watch(id, flags) {
                match e.kind() {
                    ErrorKind::Disconnected => debug!(connection = index, "peer went away"),
                    _ => self.fail(e),
                }
            }
        }
        Ok(ready.len())
    }
}
