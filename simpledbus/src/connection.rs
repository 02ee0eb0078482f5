//! One bus connection: a transport plus everything routed through it.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, trace};

use crate::continuation::{Handler, Suspended};
use crate::descriptor::{MethodDescriptor, ObjectTable, SignalDescriptor};
use crate::encode::encode;
use crate::error::*;
use crate::message::{Message, MethodCall, Reply};
use crate::transport::{DispatchStatus, Transport, WatchEvent};
use crate::value::HostValue;
use crate::watch::{WatchFlags, WatchId, WatchSet};

/// Identifies a signal subscription: emitting object, interface and member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalKey {
    pub path: String,
    pub interface: String,
    pub member: String,
}

impl SignalKey {
    pub fn new(path: &str, interface: &str, member: &str) -> Self {
        SignalKey {
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
        }
    }

    pub(crate) fn of(message: &Message) -> Self {
        SignalKey::new(message.path(), message.interface(), message.member())
    }
}

/// Renders as `path\ninterface\nmember`.
impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}\n{}\n{}", self.path, self.interface, self.member)
    }
}

/// A message filter; returns `true` when it handled the message.
pub type Filter = Box<dyn FnMut(&Message) -> bool>;

pub struct Connection {
    transport: Box<dyn Transport>,
    watches: WatchSet,
    /// Outstanding calls by serial; `None` until a continuation awaits it.
    pending: HashMap<u32, Option<Suspended>>,
    signals: HashMap<SignalKey, Handler>,
    objects: HashMap<String, ObjectTable>,
    filters: Vec<Filter>,
    /// Set once the loss of the transport was dealt with.
    hung_up: bool,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let mut connection = Connection {
            transport,
            watches: WatchSet::new(),
            pending: HashMap::new(),
            signals: HashMap::new(),
            objects: HashMap::new(),
            filters: Vec::new(),
            hung_up: false,
        };
        connection.sync_watches();
        debug!(
            unique_name = connection.unique_name().unwrap_or_default(),
            watches = connection.watches.len(),
            "connection created"
        );
        connection
    }

    pub fn unique_name(&self) -> Option<&str> {
        self.transport.unique_name()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Call a method and block until its reply arrives.
    ///
    /// Messages arriving meanwhile stay queued for the event loop. An error
    /// reply comes back as [`ErrorKind::ErrorReply`]. A call marked
    /// `no_reply` returns no values as soon as it is sent.
    pub fn call(&mut self, call: &MethodCall) -> Result<Vec<HostValue>> {
        let message = call.to_message()?;
        if message.no_reply {
            self.send(message)?;
            return Ok(Vec::new());
        }
        let reply = self.transport.send_with_reply_and_block(message)?;
        self.sync_watches();
        Reply::from_message(Some(&reply)).into_result()
    }

    /// Call the method `descriptor` describes on `object` at `target`.
    pub fn call_method(
        &mut self,
        target: &str,
        object: &str,
        descriptor: &MethodDescriptor,
        args: Vec<HostValue>,
    ) -> Result<Vec<HostValue>> {
        self.call(&descriptor.to_call(target, object, args))
    }

    /// Send `call` and open a pending slot for its reply.
    pub(crate) fn send_with_reply(&mut self, call: &MethodCall) -> Result<u32> {
        let message = call.to_message()?;
        let expects_reply = message.expects_reply();
        let serial = self.send(message)?;
        if expects_reply {
            self.pending.insert(serial, None);
        }
        Ok(serial)
    }

    pub(crate) fn send(&mut self, message: Message) -> Result<u32> {
        let serial = self.transport.send(message)?;
        self.sync_watches();
        Ok(serial)
    }

    /// Emit a signal.
    pub fn send_signal(
        &mut self,
        path: &str,
        interface: &str,
        member: &str,
        signature: &str,
        args: &[HostValue],
    ) -> Result<()> {
        let body = encode(signature, args, 0)?;
        self.send(Message::signal(path, interface, member).with_body(body))?;
        Ok(())
    }

    /// Route signals from `path`, `interface`, `member` to `handler`.
    ///
    /// There is one handler per key: subscribing again replaces the handler
    /// and hands the replaced one back.
    pub fn subscribe(
        &mut self,
        path: &str,
        interface: &str,
        member: &str,
        handler: Handler,
    ) -> Option<Handler> {
        let key = SignalKey::new(path, interface, member);
        trace!(key = %key, "subscribe");
        self.signals.insert(key, handler)
    }

    pub fn subscribe_signal(
        &mut self,
        descriptor: &SignalDescriptor,
        handler: Handler,
    ) -> Option<Handler> {
        self.subscribe(
            &descriptor.object,
            &descriptor.interface,
            &descriptor.name,
            handler,
        )
    }

    pub fn unsubscribe(&mut self, path: &str, interface: &str, member: &str) -> Option<Handler> {
        self.signals
            .remove(&SignalKey::new(path, interface, member))
    }

    /// Active subscriptions, sorted.
    pub fn subscriptions(&self) -> Vec<SignalKey> {
        let mut keys: Vec<_> = self.signals.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Serve method calls to `path` from `table`, returning the table it
    /// replaces.
    pub fn register_object_path(&mut self, path: &str, table: ObjectTable) -> Option<ObjectTable> {
        debug!(path, methods = table.len(), "register object path");
        self.objects.insert(path.into(), table)
    }

    pub fn unregister_object_path(&mut self, path: &str) -> Result<ObjectTable> {
        self.objects
            .remove(path)
            .ok_or_else(|| context!(ErrorKind::ObjectPathNotRegistered(path.into())))
    }

    /// Add a filter run on messages neither replies nor subscriptions took.
    pub fn add_filter<F>(&mut self, filter: F)
    where
        F: FnMut(&Message) -> bool + 'static,
    {
        self.filters.push(Box::new(filter));
    }

    /// Serials of outstanding calls.
    pub fn pending_calls(&self) -> Vec<u32> {
        let mut serials: Vec<_> = self.pending.keys().copied().collect();
        serials.sort_unstable();
        serials
    }

    pub fn dispatch_status(&self) -> DispatchStatus {
        self.transport.dispatch_status()
    }

    pub fn watches(&self) -> &WatchSet {
        &self.watches
    }

    pub(crate) fn watches_mut(&mut self) -> &mut WatchSet {
        &mut self.watches
    }

    /// Apply the transport's watch changes to the watch set.
    pub(crate) fn sync_watches(&mut self) {
        while let Some(event) = self.transport.poll_watch_event() {
            trace!(?event, "watch change");
            match event {
                WatchEvent::Added(watch) => self.watches.insert(watch),
                WatchEvent::Removed(id) => {
                    self.watches.remove(id);
                }
                WatchEvent::Toggled(watch) => {
                    if !self.watches.toggle(&watch) {
                        self.watches.insert(watch);
                    }
                }
            }
        }
    }

    pub(crate) fn handle_watch(&mut self, id: WatchId, flags: WatchFlags) -> Result<()> {
        let result = self.transport.handle_watch(id, flags);
        self.sync_watches();
        result
    }

    pub(crate) fn pop_message(&mut self) -> Option<Message> {
        self.transport.pop_message()
    }

    /// Remove the pending slot of `serial`. `None` if no call is
    /// outstanding under it, `Some(None)` if nobody awaits it yet.
    pub(crate) fn take_pending(&mut self, serial: u32) -> Option<Option<Suspended>> {
        self.pending.remove(&serial)
    }

    /// Park `suspended` in the open slot of `serial`; hands it back if no
    /// such call is outstanding or someone already awaits it.
    pub(crate) fn claim(
        &mut self,
        serial: u32,
        suspended: Suspended,
    ) -> std::result::Result<(), Suspended> {
        match self.pending.get_mut(&serial) {
            Some(slot) if slot.is_none() => {
                *slot = Some(suspended);
                Ok(())
            }
            _ => Err(suspended),
        }
    }

    /// All continuations waiting on this connection, with their serials.
    /// Unclaimed slots are dropped.
    pub(crate) fn take_claimed(&mut self) -> Vec<(u32, Suspended)> {
        let mut claimed: Vec<_> = self
            .pending
            .drain()
            .filter_map(|(serial, slot)| slot.map(|s| (serial, s)))
            .collect();
        claimed.sort_by_key(|(serial, _)| *serial);
        claimed
    }

    pub(crate) fn signal_handler(&mut self, key: &SignalKey) -> Option<&mut Handler> {
        self.signals.get_mut(key)
    }

    pub(crate) fn object(&mut self, path: &str) -> Option<&mut ObjectTable> {
        self.objects.get_mut(path)
    }

    /// Offer `message` to the filters in order, until one takes it.
    pub(crate) fn filter(&mut self, message: &Message) -> bool {
        self.filters.iter_mut().any(|f| f(message))
    }

    /// `true` exactly once after the transport went away.
    pub(crate) fn take_hangup(&mut self) -> bool {
        if self.hung_up || self.transport.is_connected() {
            return false;
        }
        self.hung_up = true;
        true
    }

    /// Tear the connection down. Every continuation still awaiting a reply
    /// is cancelled; returns how many were.
    pub fn close(&mut self) -> usize {
        let claimed = self.take_claimed();
        let cancelled = claimed.len();
        for (serial, mut suspended) in claimed {
            trace!(serial, "cancel pending call");
            suspended.continuation.cancel();
        }
        self.signals.clear();
        self.objects.clear();
        self.filters.clear();
        self.transport.close();
        self.sync_watches();
        self.watches.clear();
        if cancelled > 0 {
            debug!(cancelled, "connection closed with pending calls");
        }
        cancelled
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.unique_name())
            .field("connected", &self.is_connected())
            .field("pending", &self.pending.len())
            .field("signals", &self.signals.len())
            .field("objects", &self.objects.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::continuation::{Context, Continuation, Resume};
    use crate::peer::PeerTransport;

    fn pair() -> (Connection, Connection) {
        let (a, b) = PeerTransport::pair().unwrap();
        (Connection::new(Box::new(a)), Connection::new(Box::new(b)))
    }

    fn noop() -> Handler {
        Handler::from_fn(|_ctx: &mut Context<'_>, _args: Vec<HostValue>| Resume::Finished(vec![]))
    }

    #[test]
    fn test_watch_registered() {
        let (a, _b) = pair();
        assert_eq!(a.watches().len(), 1);
        assert!(a.watches().is_dirty());
    }

    #[test]
    fn test_subscribe_overwrites() {
        let (mut a, _b) = pair();
        assert!(a.subscribe("/", "org.ex", "Tick", noop()).is_none());
        assert!(a.subscribe("/", "org.ex", "Tick", noop()).is_some());
        a.subscribe_signal(&SignalDescriptor::new("org.ex", "Tock", "", "/"), noop());

        let keys = a.subscriptions();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].to_string(), "/\norg.ex\nTick");

        assert!(a.unsubscribe("/", "org.ex", "Tick").is_some());
        assert!(a.unsubscribe("/", "org.ex", "Tick").is_none());
        assert_eq!(a.subscriptions().len(), 1);
    }

    #[test]
    fn test_object_paths() {
        let (mut a, _b) = pair();
        assert!(a.register_object_path("/a", ObjectTable::new()).is_none());
        assert!(a.register_object_path("/a", ObjectTable::new()).is_some());
        assert!(a.unregister_object_path("/a").is_ok());
        let err = a.unregister_object_path("/a").unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ObjectPathNotRegistered("/a".into()));
    }

    #[test]
    fn test_claim() {
        let (mut a, _b) = pair();
        let call = MethodCall::new("", "/", "org.ex", "Ping");
        let serial = a.send_with_reply(&call).unwrap();
        assert_eq!(a.pending_calls(), vec![serial]);

        let parked = || Suspended {
            continuation: Box::new(|_ctx: &mut Context<'_>, _args: Vec<HostValue>| {
                Resume::Finished(vec![])
            }),
            reply_to: None,
        };
        assert!(a.claim(serial + 100, parked()).is_err());
        assert!(a.claim(serial, parked()).is_ok());
        // a slot is claimed once
        assert!(a.claim(serial, parked()).is_err());

        let no_reply = MethodCall::new("", "/", "org.ex", "Fire").no_reply(true);
        a.send_with_reply(&no_reply).unwrap();
        assert_eq!(a.pending_calls(), vec![serial]);
    }

    struct Flagged(Rc<Cell<usize>>);

    impl Continuation for Flagged {
        fn resume(&mut self, _ctx: &mut Context<'_>, _args: Vec<HostValue>) -> Resume {
            Resume::Finished(vec![])
        }

        fn cancel(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_close_cancels_claimed_calls() {
        let (mut a, _b) = pair();
        let cancelled = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let serial = a
                .send_with_reply(&MethodCall::new("", "/", "org.ex", "Ping"))
                .unwrap();
            let parked = Suspended {
                continuation: Box::new(Flagged(cancelled.clone())),
                reply_to: None,
            };
            assert!(a.claim(serial, parked).is_ok());
        }
        // unclaimed, dropped without cancel
        a.send_with_reply(&MethodCall::new("", "/", "org.ex", "Ping"))
            .unwrap();

        assert_eq!(a.close(), 3);
        assert_eq!(cancelled.get(), 3);
        assert!(a.pending_calls().is_empty());
        assert!(!a.is_connected());
        assert!(a.watches().is_empty());
        assert_eq!(a.close(), 0);
    }

    #[test]
    fn test_send_signal_arity() {
        let (mut a, _b) = pair();
        let err = a.send_signal("/", "org.ex", "Tick", "s", &[]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Arity { index: 1, .. }));
        assert!(a.send_signal("/", "", "Tick", "s", &["x".into()]).is_ok());
    }
}
