//! Messages, the call-site builder and reply classification.

use crate::decode::decode;
use crate::encode::encode;
use crate::error::*;
use crate::signature;
use crate::value::{Arg, HostValue};

/// The error name used when a handler could not decode its arguments.
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
/// The error name used when nothing handled a method call.
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

/// One bus message: header fields plus a typed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    /// Assigned by the transport when the message is sent.
    #[serde(default)]
    pub serial: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_serial: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    #[serde(default)]
    pub no_reply: bool,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub body: Vec<Arg>,
}

/// `None` for the empty string; an empty interface or destination means
/// "not given".
fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.into())
    }
}

impl Message {
    fn new(kind: MessageKind) -> Self {
        Message {
            kind,
            serial: 0,
            reply_serial: None,
            destination: None,
            sender: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            no_reply: false,
            signature: String::new(),
            body: Vec::new(),
        }
    }

    pub fn method_call(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        Message {
            destination: non_empty(destination),
            path: Some(path.into()),
            interface: non_empty(interface),
            member: Some(member.into()),
            ..Message::new(MessageKind::MethodCall)
        }
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Message {
            path: Some(path.into()),
            interface: non_empty(interface),
            member: Some(member.into()),
            ..Message::new(MessageKind::Signal)
        }
    }

    /// A method return answering `call`.
    pub fn method_return(call: &Message) -> Self {
        Message {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            ..Message::new(MessageKind::MethodReturn)
        }
    }

    /// An error reply answering `call`, carrying `message` as its only
    /// argument.
    pub fn error(call: &Message, name: &str, message: &str) -> Self {
        Message {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            error_name: Some(name.into()),
            ..Message::new(MessageKind::Error)
        }
        .with_body(vec![Arg::String(message.into())])
    }

    /// Replace the body, updating the signature to match.
    pub fn with_body(mut self, body: Vec<Arg>) -> Self {
        self.signature =
            signature::to_signature(&body.iter().map(Arg::wire_type).collect::<Vec<_>>());
        self.body = body;
        self
    }

    /// The text of an error message, if its first argument is a string.
    pub fn error_message(&self) -> Option<&str> {
        match self.body.first() {
            Some(Arg::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or_default()
    }

    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or_default()
    }

    pub fn member(&self) -> &str {
        self.member.as_deref().unwrap_or_default()
    }

    /// Whether the sender waits for an answer to this message.
    pub fn expects_reply(&self) -> bool {
        self.kind == MessageKind::MethodCall && !self.no_reply
    }
}

/// One outbound method invocation: where it goes, what it carries.
///
/// ```rust
/// use simpledbus::MethodCall;
///
/// let call = MethodCall::new("org.example", "/org/example", "org.example.Calc", "Add")
///     .signature("ii")
///     .args(vec![1.into(), 2.into()]);
/// let message = call.to_message().unwrap();
/// assert_eq!(message.signature, "ii");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub target: String,
    pub object: String,
    pub interface: String,
    pub method: String,
    pub signature: String,
    pub args: Vec<HostValue>,
    pub no_reply: bool,
}

impl MethodCall {
    pub fn new<S: Into<String>>(target: S, object: S, interface: S, method: S) -> Self {
        MethodCall {
            target: target.into(),
            object: object.into(),
            interface: interface.into(),
            method: method.into(),
            signature: String::new(),
            args: Vec::new(),
            no_reply: false,
        }
    }

    pub fn signature<S: Into<String>>(mut self, signature: S) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn args(mut self, args: Vec<HostValue>) -> Self {
        self.args = args;
        self
    }

    /// Mark the call as not expecting a reply.
    pub fn no_reply(mut self, no_reply: bool) -> Self {
        self.no_reply = no_reply;
        self
    }

    /// Encode the arguments and build the message.
    pub fn to_message(&self) -> Result<Message> {
        let body = encode(&self.signature, &self.args, 0)?;
        let mut message =
            Message::method_call(&self.target, &self.object, &self.interface, &self.method)
                .with_body(body);
        message.no_reply = self.no_reply;
        Ok(message)
    }
}

/// The outcome of an asynchronous call, as a continuation sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Return(Vec<HostValue>),
    Error { name: String, message: String },
    /// The connection went away before the reply arrived.
    Null,
    /// Something other than a method return or an error came back.
    Unknown,
    /// A method return whose body could not be decoded.
    Undecodable(String),
}

impl Reply {
    pub fn from_message(reply: Option<&Message>) -> Reply {
        let Some(reply) = reply else {
            return Reply::Null;
        };
        match reply.kind {
            MessageKind::MethodReturn => match decode(reply) {
                Ok(values) => Reply::Return(values),
                Err(e) => Reply::Undecodable(e.to_string()),
            },
            MessageKind::Error => Reply::Error {
                name: reply.error_name.clone().unwrap_or_default(),
                message: reply.error_message().unwrap_or_default().into(),
            },
            _ => Reply::Unknown,
        }
    }

    /// The values a continuation is resumed with: the decoded results, or
    /// `nil` followed by a message.
    pub fn into_values(self) -> Vec<HostValue> {
        let failure = |message: String| vec![HostValue::Nil, HostValue::Str(message)];
        match self {
            Reply::Return(values) => values,
            Reply::Error { message, .. } => failure(message),
            Reply::Null => failure(ErrorKind::NullReply.to_string()),
            Reply::Unknown => failure(ErrorKind::UnknownReply.to_string()),
            Reply::Undecodable(message) => failure(message),
        }
    }

    /// The synchronous view: results or an error.
    pub fn into_result(self) -> Result<Vec<HostValue>> {
        match self {
            Reply::Return(values) => Ok(values),
            Reply::Error { name, message } => Err(context!(ErrorKind::ErrorReply { name, message })),
            Reply::Null => Err(context!(ErrorKind::NullReply)),
            Reply::Unknown => Err(context!(ErrorKind::UnknownReply)),
            Reply::Undecodable(message) => Err(context!(ErrorKind::ProtocolViolation(message))),
        }
    }
}
