//! Routing of received messages and running of continuations.
//!
//! A received message is offered, in order, to the pending call it answers,
//! to the signal subscription it matches, to the connection's filters and
//! finally to the object path it addresses. A method call nobody takes is
//! answered with an `UnknownMethod` error.

use tracing::{debug, trace, warn};

use crate::connection::{Connection, SignalKey};
use crate::continuation::{ConnectionId, Context, Continuation, ReplyTo, Resume, Suspended};
use crate::decode::decode;
use crate::encode::encode;
use crate::error::*;
use crate::event_loop::EventLoop;
use crate::message::{Message, MessageKind, Reply, ERROR_INVALID_ARGS, ERROR_UNKNOWN_METHOD};
use crate::value::HostValue;

const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

/// Route every message buffered on connection `index`.
pub(crate) fn drain(event_loop: &EventLoop, connections: &mut [Connection], index: usize) {
    while let Some(message) = connections[index].pop_message() {
        route(event_loop, connections, index, message);
    }
    if connections[index].take_hangup() {
        hang_up(event_loop, connections, index);
    }
}

fn route(event_loop: &EventLoop, connections: &mut [Connection], index: usize, message: Message) {
    trace!(
        connection = index,
        kind = ?message.kind,
        serial = message.serial,
        member = message.member(),
        "route"
    );

    let handled = match message.kind {
        MessageKind::MethodReturn | MessageKind::Error => {
            route_reply(event_loop, connections, index, &message)
        }
        MessageKind::Signal => route_signal(event_loop, connections, index, &message),
        MessageKind::MethodCall => false,
    };
    if handled || connections[index].filter(&message) {
        return;
    }

    if message.kind == MessageKind::MethodCall
        && route_method_call(event_loop, connections, index, &message)
    {
        return;
    }

    debug!(
        connection = index,
        kind = ?message.kind,
        path = message.path(),
        interface = message.interface(),
        member = message.member(),
        "unhandled message"
    );
    if message.expects_reply() {
        let text = format!(
            "Method '{}' on interface '{}' at object path '{}' does not exist",
            message.member(),
            message.interface(),
            message.path()
        );
        send(
            event_loop,
            &mut connections[index],
            Message::error(&message, ERROR_UNKNOWN_METHOD, &text),
        );
    }
}

fn route_reply(
    event_loop: &EventLoop,
    connections: &mut [Connection],
    index: usize,
    message: &Message,
) -> bool {
    let Some(serial) = message.reply_serial else {
        return false;
    };
    match connections[index].take_pending(serial) {
        Some(Some(suspended)) => {
            let values = Reply::from_message(Some(message)).into_values();
            resume(event_loop, connections, ConnectionId(index), suspended, values);
            true
        }
        Some(None) => {
            trace!(serial, "reply to a call nobody awaits dropped");
            true
        }
        None => false,
    }
}

fn route_signal(
    event_loop: &EventLoop,
    connections: &mut [Connection],
    index: usize,
    message: &Message,
) -> bool {
    let key = SignalKey::of(message);
    let Some(handler) = connections[index].signal_handler(&key) else {
        return false;
    };
    let continuation = handler.spawn();

    match decode(message) {
        Ok(args) => run(event_loop, connections, ConnectionId(index), continuation, args, None),
        Err(e) => warn!(key = %key, error = %e, "signal delivery failed"),
    }
    true
}

fn route_method_call(
    event_loop: &EventLoop,
    connections: &mut [Connection],
    index: usize,
    message: &Message,
) -> bool {
    let connection = &mut connections[index];
    let Some(table) = connection.object(message.path()) else {
        return false;
    };
    let Some((descriptor, handler)) = table.lookup(message.interface.as_deref(), message.member())
    else {
        return false;
    };
    let result = descriptor.result.clone();
    let continuation = handler.spawn();

    let args = match decode(message) {
        Ok(args) => args,
        Err(e) => {
            if message.expects_reply() {
                let reply = Message::error(message, ERROR_INVALID_ARGS, &e.to_string());
                send(event_loop, connection, reply);
            }
            return true;
        }
    };

    let reply_to = ReplyTo {
        connection: ConnectionId(index),
        call: Message {
            body: Vec::new(),
            ..message.clone()
        },
        result,
    };
    run(
        event_loop,
        connections,
        ConnectionId(index),
        continuation,
        args,
        Some(reply_to),
    );
    true
}

/// Start a continuation, e.g. a handler or the loop's entry point.
pub(crate) fn run(
    event_loop: &EventLoop,
    connections: &mut [Connection],
    current: ConnectionId,
    continuation: Box<dyn Continuation>,
    args: Vec<HostValue>,
    reply_to: Option<ReplyTo>,
) {
    resume(
        event_loop,
        connections,
        current,
        Suspended {
            continuation,
            reply_to,
        },
        args,
    )
}

fn resume(
    event_loop: &EventLoop,
    connections: &mut [Connection],
    current: ConnectionId,
    mut suspended: Suspended,
    args: Vec<HostValue>,
) {
    let outcome = {
        let mut ctx = Context::new(event_loop, connections, current);
        suspended.continuation.resume(&mut ctx, args)
    };

    match outcome {
        Resume::Finished(values) => {
            if let Some(reply_to) = suspended.reply_to {
                reply(event_loop, connections, reply_to, values);
            }
        }
        Resume::Await(pending) => {
            let Some(connection) = connections.get_mut(pending.connection.0) else {
                suspended.continuation.cancel();
                event_loop.fail(context!(ErrorKind::InvalidConnection(pending.connection.0)));
                return;
            };
            if let Err(mut suspended) = connection.claim(pending.serial, suspended) {
                suspended.continuation.cancel();
                event_loop.fail(context!(ErrorKind::PendingCallNotOutstanding(
                    pending.serial
                )));
            }
        }
        Resume::Errored(message) => {
            event_loop.fail(context!(ErrorKind::Continuation(message)));
        }
    }
}

/// Answer a method call with the values its handler finished with.
///
/// A leading nil turns the reply into an error: the second value names it,
/// the optional third describes it.
fn reply(
    event_loop: &EventLoop,
    connections: &mut [Connection],
    reply_to: ReplyTo,
    values: Vec<HostValue>,
) {
    let Some(connection) = connections.get_mut(reply_to.connection.0) else {
        event_loop.fail(context!(ErrorKind::InvalidConnection(reply_to.connection.0)));
        return;
    };
    let call = &reply_to.call;

    let message = if values.first().map_or(false, HostValue::is_nil) {
        let Some(name) = values.get(1).and_then(HostValue::as_str) else {
            event_loop.fail(context!(ErrorKind::InvalidReply(
                "Return #1 nil, expected error name as #2".into()
            )));
            return;
        };
        let text = values
            .get(2)
            .and_then(HostValue::to_text)
            .unwrap_or_default();
        Message::error(call, name, &text)
    } else {
        match encode(&reply_to.result, &values, 0) {
            Ok(body) => Message::method_return(call).with_body(body),
            Err(e) => {
                if call.expects_reply() {
                    send(
                        event_loop,
                        connection,
                        Message::error(call, ERROR_FAILED, &e.to_string()),
                    );
                }
                event_loop.fail(e);
                return;
            }
        }
    };

    if call.expects_reply() {
        send(event_loop, connection, message);
    } else {
        trace!(serial = call.serial, "no reply expected");
    }
}

fn send(event_loop: &EventLoop, connection: &mut Connection, message: Message) {
    if let Err(e) = connection.send(message) {
        event_loop.fail(e);
    }
}

/// The transport of connection `index` is gone: every continuation awaiting
/// a reply on it gets the null reply.
fn hang_up(event_loop: &EventLoop, connections: &mut [Connection], index: usize) {
    let claimed = connections[index].take_claimed();
    debug!(
        connection = index,
        pending = claimed.len(),
        "connection lost"
    );
    for (serial, suspended) in claimed {
        trace!(serial, "resume with null reply");
        resume(
            event_loop,
            connections,
            ConnectionId(index),
            suspended,
            Reply::Null.into_values(),
        );
    }
    connections[index].watches_mut().clear();
}
