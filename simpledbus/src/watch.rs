//! Readiness watches and the per-connection watch set.

use std::os::unix::io::RawFd;

use bitflags::bitflags;

bitflags! {
    /// Readiness conditions of a watch, both as interest and as result.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WatchFlags: u32 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        /// Only ever reported, never requested.
        const ERROR    = 0b0100;
        /// Only ever reported, never requested.
        const HANGUP   = 0b1000;
    }
}

impl WatchFlags {
    /// `poll(2)` event mask for this interest. Errors and hangups are
    /// always part of it.
    pub fn to_poll_events(self) -> libc::c_short {
        let mut events = libc::POLLERR | libc::POLLHUP;
        if self.contains(WatchFlags::READABLE) {
            events |= libc::POLLIN;
        }
        if self.contains(WatchFlags::WRITABLE) {
            events |= libc::POLLOUT;
        }
        events
    }

    pub fn from_poll_revents(revents: libc::c_short) -> Self {
        let mut flags = WatchFlags::empty();
        if revents & libc::POLLIN != 0 {
            flags |= WatchFlags::READABLE;
        }
        if revents & libc::POLLOUT != 0 {
            flags |= WatchFlags::WRITABLE;
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            flags |= WatchFlags::ERROR;
        }
        if revents & libc::POLLHUP != 0 {
            flags |= WatchFlags::HANGUP;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u32);

/// One I/O registration of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watch {
    pub id: WatchId,
    pub fd: RawFd,
    pub flags: WatchFlags,
    pub enabled: bool,
}

/// The watches of one connection.
///
/// Every change marks the set dirty; the event loop rebuilds its wait set
/// only after a change and then calls [`WatchSet::clean`].
#[derive(Debug, Default)]
pub struct WatchSet {
    watches: Vec<Watch>,
    dirty: bool,
}

impl WatchSet {
    pub fn new() -> Self {
        WatchSet::default()
    }

    /// Add a watch, replacing one with the same id.
    pub fn insert(&mut self, watch: Watch) {
        match self.watches.iter_mut().find(|w| w.id == watch.id) {
            Some(w) => *w = watch,
            None => self.watches.push(watch),
        }
        self.dirty = true;
    }

    pub fn remove(&mut self, id: WatchId) -> Option<Watch> {
        let pos = self.watches.iter().position(|w| w.id == id)?;
        self.dirty = true;
        Some(self.watches.remove(pos))
    }

    /// Update interest and enabled state of a known watch; `false` if the
    /// watch is unknown.
    pub fn toggle(&mut self, watch: &Watch) -> bool {
        match self.watches.iter_mut().find(|w| w.id == watch.id) {
            Some(w) => {
                w.flags = watch.flags;
                w.enabled = watch.enabled;
                w.fd = watch.fd;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        if !self.watches.is_empty() {
            self.dirty = true;
        }
        self.watches.clear();
    }

    /// Enabled watches, the ones that belong into a wait set.
    pub fn enabled(&self) -> impl Iterator<Item = &Watch> {
        self.watches.iter().filter(|w| w.enabled)
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clean(&mut self) {
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watch(id: u32, flags: WatchFlags, enabled: bool) -> Watch {
        Watch {
            id: WatchId(id),
            fd: 3,
            flags,
            enabled,
        }
    }

    #[test]
    fn test_dirty_tracking() {
        let mut set = WatchSet::new();
        assert!(!set.is_dirty());

        set.insert(watch(1, WatchFlags::READABLE, true));
        set.insert(watch(2, WatchFlags::WRITABLE, false));
        assert!(set.is_dirty());
        assert_eq!(set.enabled().count(), 1);
        set.clean();

        assert!(set.toggle(&watch(2, WatchFlags::WRITABLE, true)));
        assert!(set.is_dirty());
        assert_eq!(set.enabled().count(), 2);
        set.clean();

        assert!(!set.toggle(&watch(9, WatchFlags::READABLE, true)));
        assert!(!set.is_dirty());

        assert!(set.remove(WatchId(1)).is_some());
        assert!(set.remove(WatchId(1)).is_none());
        assert!(set.is_dirty());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_poll_translation() {
        let events = (WatchFlags::READABLE | WatchFlags::WRITABLE).to_poll_events();
        assert_ne!(events & libc::POLLIN, 0);
        assert_ne!(events & libc::POLLOUT, 0);
        assert_ne!(events & libc::POLLHUP, 0);
        assert_eq!(WatchFlags::READABLE.to_poll_events() & libc::POLLOUT, 0);

        let flags = WatchFlags::from_poll_revents(libc::POLLIN | libc::POLLHUP);
        assert_eq!(flags, WatchFlags::READABLE | WatchFlags::HANGUP);
        assert_eq!(
            WatchFlags::from_poll_revents(libc::POLLNVAL),
            WatchFlags::ERROR
        );
    }
}
