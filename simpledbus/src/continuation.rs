//! Resumable continuations and the context they run in.
//!
//! A continuation is the code waiting behind a call site. It runs until it
//! either finishes, fails, or issues an asynchronous call and asks to be
//! resumed with that call's reply. The event loop keeps a suspended
//! continuation in the pending slot of its call and resumes it when the reply
//! arrives.

use std::fmt;

use crate::connection::Connection;
use crate::error::*;
use crate::event_loop::EventLoop;
use crate::message::{Message, MethodCall};
use crate::value::HostValue;

/// Index of a connection in the slice an [`EventLoop`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

/// Token of an outstanding asynchronous call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingCall {
    pub connection: ConnectionId,
    pub serial: u32,
}

/// What a continuation did with control.
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// Done. For a method handler these values are the reply.
    Finished(Vec<HostValue>),
    /// Resume me with the reply to this call.
    Await(PendingCall),
    /// Unrecoverable; stops the loop.
    Errored(String),
}

impl From<Error> for Resume {
    fn from(e: Error) -> Self {
        Resume::Errored(e.to_string())
    }
}

pub trait Continuation {
    /// Run until the next suspension point. `args` are the call or signal
    /// arguments on the first resume, and the reply values afterwards.
    fn resume(&mut self, ctx: &mut Context<'_>, args: Vec<HostValue>) -> Resume;

    /// The continuation will never be resumed again.
    fn cancel(&mut self) {}
}

impl<F> Continuation for F
where
    F: FnMut(&mut Context<'_>, Vec<HostValue>) -> Resume,
{
    fn resume(&mut self, ctx: &mut Context<'_>, args: Vec<HostValue>) -> Resume {
        self(ctx, args)
    }
}

/// Box a closure as a continuation.
pub fn continuation<F>(f: F) -> Box<dyn Continuation>
where
    F: FnMut(&mut Context<'_>, Vec<HostValue>) -> Resume + 'static,
{
    Box::new(f)
}

/// Spawns a fresh continuation for every signal or method call it handles.
pub struct Handler {
    spawn: Box<dyn FnMut() -> Box<dyn Continuation>>,
}

impl Handler {
    pub fn new<F>(factory: F) -> Self
    where
        F: FnMut() -> Box<dyn Continuation> + 'static,
    {
        Handler {
            spawn: Box::new(factory),
        }
    }

    /// A handler running a copy of `f` for every invocation.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnMut(&mut Context<'_>, Vec<HostValue>) -> Resume + Clone + 'static,
    {
        Handler::new(move || Box::new(f.clone()) as Box<dyn Continuation>)
    }

    pub fn spawn(&mut self) -> Box<dyn Continuation> {
        (self.spawn)()
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Handler")
    }
}

/// Where the reply of a method handler goes once it finishes.
#[derive(Debug, Clone)]
pub(crate) struct ReplyTo {
    pub connection: ConnectionId,
    /// The call being answered, body stripped.
    pub call: Message,
    /// Signature of the reply values.
    pub result: String,
}

/// A continuation parked in a pending slot.
pub(crate) struct Suspended {
    pub continuation: Box<dyn Continuation>,
    pub reply_to: Option<ReplyTo>,
}

/// The world as seen from inside a running continuation.
pub struct Context<'a> {
    event_loop: &'a EventLoop,
    connections: &'a mut [Connection],
    current: ConnectionId,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        event_loop: &'a EventLoop,
        connections: &'a mut [Connection],
        current: ConnectionId,
    ) -> Self {
        Context {
            event_loop,
            connections,
            current,
        }
    }

    /// The connection the triggering message arrived on.
    pub fn current(&self) -> ConnectionId {
        self.current
    }

    pub fn connection(&mut self, id: ConnectionId) -> Result<&mut Connection> {
        self.connections
            .get_mut(id.0)
            .ok_or_else(|| context!(ErrorKind::InvalidConnection(id.0)))
    }

    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    /// Send `call` on connection `id` without waiting. Return
    /// `Resume::Await` with the token to be resumed with the reply.
    pub fn call(&mut self, id: ConnectionId, call: &MethodCall) -> Result<PendingCall> {
        let serial = self.connection(id)?.send_with_reply(call)?;
        Ok(PendingCall {
            connection: id,
            serial,
        })
    }

    /// Ask the loop to stop once the current message is dealt with.
    pub fn stop(&self, values: Vec<HostValue>) -> Result<()> {
        self.event_loop.stop(values)
    }

    pub fn event_loop(&self) -> &'a EventLoop {
        self.event_loop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Counter {
        resumed: usize,
    }

    impl Continuation for Counter {
        fn resume(&mut self, _ctx: &mut Context<'_>, args: Vec<HostValue>) -> Resume {
            self.resumed += 1;
            Resume::Finished(vec![(self.resumed as u32).into(), args.len().to_string().into()])
        }
    }

    #[test]
    fn test_handler_spawns_fresh_continuations() {
        let mut handler = Handler::new(|| Box::new(Counter::default()) as Box<dyn Continuation>);
        let event_loop = EventLoop::new();
        let mut none: [Connection; 0] = [];
        let mut ctx = Context::new(&event_loop, &mut none, ConnectionId(0));

        for _ in 0..2 {
            let mut c = handler.spawn();
            assert_eq!(
                c.resume(&mut ctx, vec![HostValue::Nil]),
                Resume::Finished(vec![1.into(), "1".into()])
            );
        }
    }

    #[test]
    fn test_closure_keeps_state() {
        let mut step = 0;
        let mut c = continuation(move |_ctx: &mut Context<'_>, _args: Vec<HostValue>| {
            step += 1;
            Resume::Finished(vec![step.into()])
        });
        let event_loop = EventLoop::new();
        let mut none: [Connection; 0] = [];
        let mut ctx = Context::new(&event_loop, &mut none, ConnectionId(0));
        c.resume(&mut ctx, vec![]);
        assert_eq!(c.resume(&mut ctx, vec![]), Resume::Finished(vec![2.into()]));
    }

    #[test]
    fn test_context_errors() {
        let event_loop = EventLoop::new();
        let mut none: [Connection; 0] = [];
        let mut ctx = Context::new(&event_loop, &mut none, ConnectionId(0));
        let err = ctx.connection(ConnectionId(3)).err().unwrap();
        assert_eq!(err.kind(), &ErrorKind::InvalidConnection(3));
        let err = ctx.stop(vec![]).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::LoopNotRunning);
        assert_eq!(
            Resume::from(err),
            Resume::Errored("Main loop not running".into())
        );
    }
}
