use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;

use static_assertions::assert_impl_all;

use crate::message::{ERROR_INVALID_ARGS, ERROR_UNKNOWN_METHOD};
use crate::*;

assert_impl_all!(Error: Send, Sync);
assert_impl_all!(PeerTransport: Send);

fn stop_with(ctx: &mut Context<'_>, values: Vec<HostValue>) -> Resume {
    match ctx.stop(values) {
        Ok(()) => Resume::Finished(vec![]),
        Err(e) => e.into(),
    }
}

fn calc_objects() -> ObjectTable {
    let mut objects = ObjectTable::new();
    objects
        .method(
            MethodDescriptor::new("org.example.Calc", "Add", "ii", "i"),
            Handler::from_fn(|_ctx: &mut Context<'_>, args: Vec<HostValue>| {
                let sum: f64 = args.iter().filter_map(HostValue::as_f64).sum();
                Resume::Finished(vec![sum.into()])
            }),
        )
        .method(
            MethodDescriptor::new("org.example.Calc", "Fail", "", ""),
            Handler::from_fn(|_ctx: &mut Context<'_>, _args: Vec<HostValue>| {
                Resume::Finished(vec![
                    HostValue::Nil,
                    "org.example.Error.Broken".into(),
                    "it broke".into(),
                ])
            }),
        )
        .method(
            MethodDescriptor::new("org.example.Calc", "Quit", "", ""),
            Handler::from_fn(|ctx: &mut Context<'_>, _args: Vec<HostValue>| {
                stop_with(ctx, vec!["quit".into()])
            }),
        );
    objects
}

/// A server connection running its own loop in a thread.
fn serve(transport: PeerTransport) -> thread::JoinHandle<Result<Vec<HostValue>>> {
    thread::spawn(move || {
        let mut server = Connection::new(Box::new(transport));
        server.register_object_path("/calc", calc_objects());
        EventLoop::new().run(&mut [server], None)
    })
}

fn calc(method: &str) -> MethodCall {
    MethodCall::new("", "/calc", "org.example.Calc", method)
}

#[test]
fn test_sync_calls_against_server_loop() {
    let (a, b) = PeerTransport::pair().unwrap();
    let server = serve(a);
    let mut client = Connection::new(Box::new(b));

    let values = client
        .call(&calc("Add").signature("ii").args(vec![2.into(), 3.into()]))
        .unwrap();
    assert_eq!(values, vec![HostValue::from(5)]);

    // fractional arguments are truncated on the way out
    let values = client
        .call(&calc("Add").signature("ii").args(vec![2.9.into(), (-1.5).into()]))
        .unwrap();
    assert_eq!(values, vec![HostValue::from(1)]);

    let err = client.call(&calc("Fail")).unwrap_err();
    assert_eq!(
        err.kind(),
        &ErrorKind::ErrorReply {
            name: "org.example.Error.Broken".into(),
            message: "it broke".into(),
        }
    );

    let err = client.call(&calc("Nope")).unwrap_err();
    assert_eq!(
        err.kind(),
        &ErrorKind::ErrorReply {
            name: ERROR_UNKNOWN_METHOD.into(),
            message: "Method 'Nope' on interface 'org.example.Calc' at object path '/calc' does \
                      not exist"
                .into(),
        }
    );

    let descriptor = MethodDescriptor::new("org.example.Calc", "Add", "ii", "i");
    let values = client
        .call_method("", "/calc", &descriptor, vec![40.into(), 2.into()])
        .unwrap();
    assert_eq!(values, vec![HostValue::from(42)]);

    assert!(client.call(&calc("Quit")).unwrap().is_empty());
    assert_eq!(
        server.join().unwrap().unwrap(),
        vec![HostValue::from("quit")]
    );
}

#[test]
fn test_invalid_args() {
    let (a, mut b) = PeerTransport::pair().unwrap();
    let server = serve(a);

    let mut call = Message::method_call("", "/calc", "org.example.Calc", "Add");
    call.signature = "ii".into();
    call.body = vec![Arg::String("two".into())];
    let reply = b.send_with_reply_and_block(call).unwrap();
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.error_name.as_deref(), Some(ERROR_INVALID_ARGS));

    let quit = calc("Quit").to_message().unwrap();
    b.send_with_reply_and_block(quit).unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn test_async_call_in_one_loop() {
    let (a, b) = PeerTransport::pair().unwrap();
    let mut server = Connection::new(Box::new(a));
    server.register_object_path("/calc", calc_objects());
    let client = Connection::new(Box::new(b));
    let mut connections = vec![server, client];

    let replies = Rc::new(RefCell::new(Vec::new()));
    let seen = replies.clone();
    let mut step = 0;
    let event_loop = EventLoop::new();
    let values = event_loop
        .run(
            &mut connections,
            Some(continuation(move |ctx: &mut Context<'_>, args: Vec<HostValue>| {
                step += 1;
                let call = match step {
                    1 => calc("Add").signature("ii").args(vec![1.into(), 2.into()]),
                    2 => {
                        seen.borrow_mut().push(args);
                        calc("Fail")
                    }
                    _ => {
                        seen.borrow_mut().push(args);
                        return stop_with(ctx, vec![]);
                    }
                };
                match ctx.call(ConnectionId(1), &call) {
                    Ok(pending) => Resume::Await(pending),
                    Err(e) => e.into(),
                }
            })),
        )
        .unwrap();

    assert_eq!(values, vec![HostValue::Bool(true)]);
    assert_eq!(
        *replies.borrow(),
        vec![
            vec![HostValue::from(3)],
            vec![HostValue::Nil, HostValue::from("it broke")],
        ]
    );
    assert!(connections[1].pending_calls().is_empty());
}

#[test]
fn test_duplicate_reply_resumes_once() {
    let (a, b) = PeerTransport::pair().unwrap();
    let mut client = Connection::new(Box::new(a));
    let stray = Rc::new(Cell::new(0));
    let count = stray.clone();
    client.add_filter(move |message: &Message| {
        if message.kind == MessageKind::MethodReturn {
            count.set(count.get() + 1);
        }
        true
    });
    let mut connections = vec![client];

    let peer = Rc::new(RefCell::new(b));
    let server = peer.clone();
    let resumed = Rc::new(Cell::new(0));
    let resumes = resumed.clone();
    let mut started = false;
    let event_loop = EventLoop::new();
    let values = event_loop
        .run(
            &mut connections,
            Some(continuation(move |ctx: &mut Context<'_>, args: Vec<HostValue>| {
                if started {
                    resumes.set(resumes.get() + 1);
                    return stop_with(ctx, args);
                }
                started = true;
                let call = calc("Add").signature("ii").args(vec![1.into(), 2.into()]);
                let pending = match ctx.call(ConnectionId(0), &call) {
                    Ok(pending) => pending,
                    Err(e) => return e.into(),
                };
                // answer the same call twice
                let mut b = server.borrow_mut();
                b.handle_watch(WatchId(1), WatchFlags::READABLE).unwrap();
                let call = b.pop_message().unwrap();
                for n in [3, 4] {
                    b.send(Message::method_return(&call).with_body(vec![Arg::Int32(n)]))
                        .unwrap();
                }
                Resume::Await(pending)
            })),
        )
        .unwrap();
    event_loop.poll_once(&mut connections).unwrap();

    assert_eq!(values, vec![HostValue::from(3)]);
    assert_eq!(resumed.get(), 1);
    assert_eq!(stray.get(), 1);
    assert!(connections[0].pending_calls().is_empty());
    assert!(connections[0].is_connected());
    drop(peer);
}

#[test]
fn test_error_reply_without_name_fails_loop() {
    let (a, b) = PeerTransport::pair().unwrap();
    let mut server = Connection::new(Box::new(a));
    let mut objects = ObjectTable::new();
    objects.method(
        MethodDescriptor::new("org.example.Bad", "Nil", "", ""),
        Handler::from_fn(|_ctx: &mut Context<'_>, _args: Vec<HostValue>| {
            Resume::Finished(vec![HostValue::Nil])
        }),
    );
    server.register_object_path("/", objects);
    let mut connections = vec![server, Connection::new(Box::new(b))];

    let err = EventLoop::new()
        .run(
            &mut connections,
            Some(continuation(|ctx: &mut Context<'_>, _args: Vec<HostValue>| {
                let call = MethodCall::new("", "/", "org.example.Bad", "Nil");
                match ctx.call(ConnectionId(1), &call) {
                    Ok(pending) => Resume::Await(pending),
                    Err(e) => e.into(),
                }
            })),
        )
        .unwrap_err();
    assert_eq!(
        err.kind(),
        &ErrorKind::InvalidReply("Return #1 nil, expected error name as #2".into())
    );
}

#[test]
fn test_null_reply_on_disconnect() {
    let (a, b) = PeerTransport::pair().unwrap();
    let mut connections = vec![Connection::new(Box::new(a))];
    let mut peer = Some(b);

    let values = EventLoop::new()
        .run(
            &mut connections,
            Some(continuation(move |ctx: &mut Context<'_>, args: Vec<HostValue>| {
                let Some(mut b) = peer.take() else {
                    return stop_with(ctx, args);
                };
                let call = calc("Add").signature("ii").args(vec![1.into(), 1.into()]);
                let pending = match ctx.call(ConnectionId(0), &call) {
                    Ok(pending) => pending,
                    Err(e) => return e.into(),
                };
                // read the call, then go away without answering
                let _ = b.handle_watch(WatchId(1), WatchFlags::READABLE);
                assert!(b.pop_message().is_some());
                drop(b);
                Resume::Await(pending)
            })),
        )
        .unwrap();

    assert_eq!(values, vec![HostValue::Nil, HostValue::from("Reply null")]);
    assert!(!connections[0].is_connected());
    assert!(connections[0].watches().is_empty());
}

#[test]
fn test_signals_drain_in_one_pass() {
    let (a, b) = PeerTransport::pair().unwrap();
    let mut listener = Connection::new(Box::new(a));
    let mut emitter = Connection::new(Box::new(b));

    let ticks = Rc::new(RefCell::new(Vec::new()));
    let seen = ticks.clone();
    listener.subscribe(
        "/clock",
        "org.example.Clock",
        "Tick",
        Handler::from_fn(move |_ctx: &mut Context<'_>, args: Vec<HostValue>| {
            seen.borrow_mut().extend(args);
            Resume::Finished(vec![])
        }),
    );

    for n in 1..=3u32 {
        emitter
            .send_signal("/clock", "org.example.Clock", "Tick", "u", &[n.into()])
            .unwrap();
    }
    // nobody listens for this one
    emitter
        .send_signal("/clock", "org.example.Clock", "Tock", "", &[])
        .unwrap();

    let mut connections = vec![listener, emitter];
    let event_loop = EventLoop::new();
    event_loop.poll_once(&mut connections).unwrap();

    assert_eq!(event_loop.watched_fds(), 2);
    assert_eq!(
        *ticks.borrow(),
        vec![HostValue::from(1), HostValue::from(2), HostValue::from(3)]
    );
    assert_eq!(connections[0].dispatch_status(), DispatchStatus::Complete);
}

#[test]
fn test_filters() {
    let (a, mut b) = PeerTransport::pair().unwrap();
    let mut connection = Connection::new(Box::new(a));

    let filtered = Rc::new(RefCell::new(Vec::new()));
    let log = filtered.clone();
    connection.add_filter(move |message: &Message| {
        log.borrow_mut().push(message.member().to_string());
        message.member() == "Ping"
    });

    b.send(Message::signal("/", "org.example.Chat", "Hello"))
        .unwrap();
    b.send(Message::method_call("", "/", "org.example.Chat", "Ping"))
        .unwrap();
    let pong = b
        .send(Message::method_call("", "/", "org.example.Chat", "Pong"))
        .unwrap();

    let mut connections = vec![connection];
    EventLoop::new().poll_once(&mut connections).unwrap();
    assert_eq!(*filtered.borrow(), vec!["Hello", "Ping", "Pong"]);

    // only the call the filter declined is answered
    b.handle_watch(WatchId(1), WatchFlags::READABLE).unwrap();
    let reply = b.pop_message().unwrap();
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.reply_serial, Some(pong));
    assert_eq!(reply.error_name.as_deref(), Some(ERROR_UNKNOWN_METHOD));
    assert!(b.pop_message().is_none());
}

#[test]
fn test_no_reply() {
    let (a, b) = PeerTransport::pair().unwrap();
    let mut server = Connection::new(Box::new(a));
    let served = Rc::new(Cell::new(0));
    let count = served.clone();
    let mut objects = ObjectTable::new();
    objects.method(
        MethodDescriptor::new("org.example.Log", "Write", "s", "b"),
        Handler::from_fn(move |ctx: &mut Context<'_>, args: Vec<HostValue>| {
            count.set(count.get() + 1);
            if let Err(e) = ctx.stop(args) {
                return e.into();
            }
            Resume::Finished(vec![true.into()])
        }),
    );
    server.register_object_path("/log", objects);

    let mut client = Connection::new(Box::new(b));
    let replies = Rc::new(Cell::new(0));
    let counter = replies.clone();
    client.add_filter(move |message: &Message| {
        if message.kind == MessageKind::MethodReturn {
            counter.set(counter.get() + 1);
        }
        false
    });

    let write = |text: &str| {
        MethodCall::new("", "/log", "org.example.Log", "Write")
            .signature("s")
            .args(vec![text.into()])
            .no_reply(true)
    };
    assert!(client.call(&write("sync")).unwrap().is_empty());

    let mut connections = vec![server, client];
    let event_loop = EventLoop::new();
    let values = event_loop.run(&mut connections, None).unwrap();
    assert_eq!(values, vec![HostValue::from("sync")]);

    let values = event_loop
        .run(
            &mut connections,
            Some(continuation(move |ctx: &mut Context<'_>, _args: Vec<HostValue>| {
                match ctx.call(ConnectionId(1), &write("async")) {
                    Ok(_) => Resume::Finished(vec![]),
                    Err(e) => e.into(),
                }
            })),
        )
        .unwrap();
    assert_eq!(values, vec![HostValue::from("async")]);

    event_loop.poll_once(&mut connections).unwrap();
    assert_eq!(served.get(), 2);
    assert_eq!(replies.get(), 0);
    assert!(connections[1].pending_calls().is_empty());
}

#[test]
fn test_invalid_connection() {
    let (a, _b) = PeerTransport::pair().unwrap();
    let mut connections = vec![Connection::new(Box::new(a))];
    let err = EventLoop::new()
        .run(
            &mut connections,
            Some(continuation(|ctx: &mut Context<'_>, _args: Vec<HostValue>| {
                assert_eq!(ctx.connections(), 1);
                match ctx.call(ConnectionId(3), &calc("Quit")) {
                    Ok(pending) => Resume::Await(pending),
                    Err(e) => e.into(),
                }
            })),
        )
        .unwrap_err();
    assert_eq!(
        err.kind(),
        &ErrorKind::Continuation("No connection with id 3".into())
    );
}
