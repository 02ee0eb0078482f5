//! The connection object a [`Connection`](crate::Connection) drives.
//!
//! A transport already speaks the wire protocol. It sends and receives whole
//! messages, tells which file descriptors it needs watched and does its I/O
//! when told they are ready.

use crate::error::*;
use crate::message::Message;
use crate::watch::{Watch, WatchFlags, WatchId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// At least one received message is waiting in [`Transport::pop_message`].
    DataRemains,
    Complete,
}

/// A change to the set of descriptors a transport wants watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(Watch),
    Removed(WatchId),
    /// Interest or enabled state of a known watch changed.
    Toggled(Watch),
}

pub trait Transport {
    /// Queue `message` for sending and return the serial assigned to it.
    fn send(&mut self, message: Message) -> Result<u32>;

    /// Send `message` and wait for its reply, keeping anything else that
    /// arrives meanwhile for [`pop_message`](Transport::pop_message).
    fn send_with_reply_and_block(&mut self, message: Message) -> Result<Message>;

    fn dispatch_status(&self) -> DispatchStatus;

    /// Take the next received message.
    fn pop_message(&mut self) -> Option<Message>;

    /// Take the next pending watch change.
    fn poll_watch_event(&mut self) -> Option<WatchEvent>;

    /// Perform the I/O a watch became ready for.
    fn handle_watch(&mut self, id: WatchId, flags: WatchFlags) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// The name the peer or bus knows this end by, once assigned.
    fn unique_name(&self) -> Option<&str>;

    fn close(&mut self);
}
