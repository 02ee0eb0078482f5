//! Host value marshaling and a cooperative event loop for D-Bus style buses.
//!
//! The crate has two halves:
//!
//! * a signature driven codec, [`encode`](encode::encode) and
//!   [`decode`](decode::decode), translating between loosely typed
//!   [`HostValue`]s and typed wire [`Arg`]s;
//! * a [`Connection`] multiplexer driven by an [`EventLoop`], which routes
//!   replies, signals and incoming method calls to resumable
//!   [`Continuation`]s.
//!
//! The bus connection itself is abstracted by the [`Transport`] trait. A
//! point-to-point implementation, [`PeerTransport`], frames messages as NUL
//! terminated JSON over a Unix or TCP stream.
//!
//! ```rust
//! use simpledbus::{encode, decode_args, HostValue};
//!
//! let args = encode("a{sv}i", &[
//!     HostValue::Map(vec![("answer", 42)].into_iter().collect()),
//!     HostValue::Number(-7.9),
//! ], 0).unwrap();
//!
//! assert_eq!(args.len(), 2);
//! let values = decode_args(&args).unwrap();
//! assert_eq!(values[1], HostValue::Number(-7.0));
//! ```
//!
//! A loop over both ends of a connection pair, where the entry continuation
//! performs an asynchronous call and stops the loop with the result:
//!
//! ```rust
//! use simpledbus::*;
//!
//! # fn main() -> Result<()> {
//! let (a, b) = PeerTransport::pair()?;
//! let mut server = Connection::new(Box::new(a));
//! let client = Connection::new(Box::new(b));
//!
//! let mut objects = ObjectTable::new();
//! objects.method(
//!     MethodDescriptor::new("org.example.Echo", "Echo", "s", "s"),
//!     Handler::from_fn(|_ctx: &mut Context<'_>, args: Vec<HostValue>| Resume::Finished(args)),
//! );
//! server.register_object_path("/", objects);
//!
//! let mut connections = vec![server, client];
//! let event_loop = EventLoop::new();
//! let mut first = true;
//! let values = event_loop.run(
//!     &mut connections,
//!     Some(continuation(move |ctx: &mut Context<'_>, args: Vec<HostValue>| {
//!         if first {
//!             first = false;
//!             let call = MethodCall::new("", "/", "org.example.Echo", "Echo")
//!                 .signature("s")
//!                 .args(vec!["ping".into()]);
//!             return match ctx.call(ConnectionId(1), &call) {
//!                 Ok(pending) => Resume::Await(pending),
//!                 Err(e) => e.into(),
//!             };
//!         }
//!         match ctx.stop(args) {
//!             Ok(()) => Resume::Finished(vec![]),
//!             Err(e) => e.into(),
//!         }
//!     })),
//! )?;
//! assert_eq!(values, vec![HostValue::from("ping")]);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate serde_derive;

/// Build an [`Error`] from an [`ErrorKind`], optionally wrapping a source
/// error, and record where it was raised.
#[macro_export]
macro_rules! context {
    ($k:expr) => {
        $crate::Error::new($k, None, Some(concat!(file!(), ":", line!())))
    };
    ($e:expr, $k:expr) => {
        $crate::Error::new(
            $k,
            Some(Box::from($e)),
            Some(concat!(file!(), ":", line!())),
        )
    };
}

/// A closure for `map_err`, wrapping the error with [`context!`].
///
/// Without arguments the kind is derived from the error via `From<&E>`.
#[macro_export]
macro_rules! map_context {
    () => {
        |e| $crate::context!(e, $crate::ErrorKind::from(&e))
    };
    ($k:expr) => {
        |e| $crate::context!(e, $k)
    };
}

pub mod connection;
pub mod continuation;
pub mod decode;
pub mod descriptor;
mod dispatch;
pub mod encode;
pub mod error;
pub mod event_loop;
pub mod message;
pub mod peer;
pub mod signature;
pub mod stream;
pub mod transport;
pub mod value;
pub mod watch;

#[cfg(test)]
mod test;

pub use crate::connection::{Connection, SignalKey};
pub use crate::continuation::{
    continuation, Context, Continuation, ConnectionId, Handler, PendingCall, Resume,
};
pub use crate::decode::{decode, decode_args};
pub use crate::descriptor::{DescriptorTable, MethodDescriptor, ObjectTable, SignalDescriptor};
pub use crate::encode::encode;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::event_loop::{EventLoop, LoopConfig};
pub use crate::message::{Message, MessageKind, MethodCall, Reply};
pub use crate::peer::PeerTransport;
pub use crate::signature::{Signature, SignatureIter, WireType};
pub use crate::transport::{DispatchStatus, Transport, WatchEvent};
pub use crate::value::{Arg, HostMap, HostValue};
pub use crate::watch::{Watch, WatchFlags, WatchId, WatchSet};
