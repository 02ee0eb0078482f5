//! Method and signal descriptors, and the per-object method tables.
//!
//! Descriptors are what introspection yields for an interface: per member the
//! argument signature and, for methods, the result signature. The table keeps
//! the first descriptor it sees for a given `(interface, member)`.

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::continuation::Handler;
use crate::error::*;
use crate::message::MethodCall;
use crate::value::HostValue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub interface: String,
    /// Signature of the arguments.
    #[serde(default)]
    pub signature: String,
    /// Signature of the reply.
    #[serde(default)]
    pub result: String,
}

impl MethodDescriptor {
    pub fn new<S: Into<String>>(interface: S, name: S, signature: S, result: S) -> Self {
        MethodDescriptor {
            name: name.into(),
            interface: interface.into(),
            signature: signature.into(),
            result: result.into(),
        }
    }

    /// The `interface.member` key incoming calls are looked up by.
    pub fn key(&self) -> String {
        format!("{}.{}", self.interface, self.name)
    }

    /// A call of this method on `object` at `target`.
    pub fn to_call(&self, target: &str, object: &str, args: Vec<HostValue>) -> MethodCall {
        MethodCall::new(target, object, self.interface.as_str(), self.name.as_str())
            .signature(self.signature.as_str())
            .args(args)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDescriptor {
    pub name: String,
    pub interface: String,
    #[serde(default)]
    pub signature: String,
    /// Object path the signal is emitted from.
    pub object: String,
}

impl SignalDescriptor {
    pub fn new<S: Into<String>>(interface: S, name: S, signature: S, object: S) -> Self {
        SignalDescriptor {
            name: name.into(),
            interface: interface.into(),
            signature: signature.into(),
            object: object.into(),
        }
    }
}

#[derive(Deserialize)]
struct Introspection {
    #[serde(default)]
    methods: Vec<MethodDescriptor>,
    #[serde(default)]
    signals: Vec<SignalDescriptor>,
}

type Key = (String, String);

/// Descriptors by `(interface, member)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescriptorTable {
    methods: BTreeMap<Key, MethodDescriptor>,
    signals: BTreeMap<Key, SignalDescriptor>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        DescriptorTable::default()
    }

    /// Load `{"methods": [...], "signals": [...]}` as produced by an
    /// introspection parser.
    pub fn from_json(json: &str) -> Result<Self> {
        let introspection: Introspection = serde_json::from_str(json).map_err(map_context!())?;
        let mut table = DescriptorTable::new();
        for m in introspection.methods {
            table.insert_method(m);
        }
        for s in introspection.signals {
            table.insert_signal(s);
        }
        Ok(table)
    }

    /// Insert unless a method with the same key is known; `false` if the
    /// descriptor was ignored.
    pub fn insert_method(&mut self, descriptor: MethodDescriptor) -> bool {
        let key = (descriptor.interface.clone(), descriptor.name.clone());
        if self.methods.contains_key(&key) {
            return false;
        }
        self.methods.insert(key, descriptor);
        true
    }

    pub fn insert_signal(&mut self, descriptor: SignalDescriptor) -> bool {
        let key = (descriptor.interface.clone(), descriptor.name.clone());
        if self.signals.contains_key(&key) {
            return false;
        }
        self.signals.insert(key, descriptor);
        true
    }

    /// Look a method up. An empty `interface` matches the first method of
    /// that name in any interface.
    pub fn method(&self, interface: &str, member: &str) -> Option<&MethodDescriptor> {
        if interface.is_empty() {
            return self.methods.values().find(|m| m.name == member);
        }
        self.methods.get(&(interface.into(), member.into()))
    }

    pub fn signal(&self, interface: &str, member: &str) -> Option<&SignalDescriptor> {
        if interface.is_empty() {
            return self.signals.values().find(|s| s.name == member);
        }
        self.signals.get(&(interface.into(), member.into()))
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.values()
    }

    pub fn signals(&self) -> impl Iterator<Item = &SignalDescriptor> {
        self.signals.values()
    }
}

/// The methods served at one object path.
#[derive(Debug, Default)]
pub struct ObjectTable {
    methods: HashMap<String, (MethodDescriptor, Handler)>,
}

impl ObjectTable {
    pub fn new() -> Self {
        ObjectTable::default()
    }

    /// Serve `descriptor` with `handler`, replacing an earlier entry with the
    /// same `interface.member`.
    pub fn method(&mut self, descriptor: MethodDescriptor, handler: Handler) -> &mut Self {
        self.methods.insert(descriptor.key(), (descriptor, handler));
        self
    }

    /// Find the entry for an incoming call; without an interface any method
    /// of that name matches.
    pub(crate) fn lookup(
        &mut self,
        interface: Option<&str>,
        member: &str,
    ) -> Option<&mut (MethodDescriptor, Handler)> {
        match interface {
            Some(interface) => self.methods.get_mut(&format!("{}.{}", interface, member)),
            None => {
                // deterministic pick when several interfaces share the name
                let key = self
                    .methods
                    .iter()
                    .filter(|(_, (d, _))| d.name == member)
                    .map(|(k, _)| k)
                    .min()?
                    .clone();
                self.methods.get_mut(&key)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::{Context, Resume};

    #[test]
    fn test_first_descriptor_wins() {
        let mut table = DescriptorTable::new();
        assert!(table.insert_method(MethodDescriptor::new("org.ex.A", "Get", "s", "v")));
        assert!(!table.insert_method(MethodDescriptor::new("org.ex.A", "Get", "i", "i")));
        assert!(table.insert_method(MethodDescriptor::new("org.ex.B", "Get", "", "u")));
        assert_eq!(table.method("org.ex.A", "Get").unwrap().signature, "s");
        assert_eq!(table.method("", "Get").unwrap().interface, "org.ex.A");
        assert!(table.method("org.ex.C", "Get").is_none());
    }

    #[test]
    fn test_from_json() {
        let table = DescriptorTable::from_json(
            r#"{
                "methods": [
                    {"name": "Ping", "interface": "org.ex.Ping", "signature": "s", "result": "s"}
                ],
                "signals": [
                    {"name": "Pong", "interface": "org.ex.Ping", "signature": "s", "object": "/ping"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(table.methods().count(), 1);
        assert_eq!(table.signal("org.ex.Ping", "Pong").unwrap().object, "/ping");

        let err = DescriptorTable::from_json("{\"methods\": 1}").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::SerdeJsonDe(_)));
    }

    #[test]
    fn test_to_call() {
        let d = MethodDescriptor::new("org.ex.Calc", "Add", "ii", "i");
        let call = d.to_call("org.ex", "/calc", vec![1.into(), 2.into()]);
        assert_eq!(call.interface, "org.ex.Calc");
        assert_eq!(call.signature, "ii");
        assert_eq!(call.args.len(), 2);
    }

    #[test]
    fn test_object_lookup() {
        let noop = || Handler::from_fn(|_ctx: &mut Context<'_>, _args: Vec<HostValue>| {
            Resume::Finished(vec![])
        });
        let mut table = ObjectTable::new();
        table
            .method(MethodDescriptor::new("org.ex.B", "Run", "", ""), noop())
            .method(MethodDescriptor::new("org.ex.A", "Run", "s", ""), noop())
            .method(MethodDescriptor::new("org.ex.A", "Run", "i", ""), noop());
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(Some("org.ex.A"), "Run").unwrap().0.signature, "i");
        assert_eq!(table.lookup(None, "Run").unwrap().0.interface, "org.ex.A");
        assert!(table.lookup(Some("org.ex.C"), "Run").is_none());
        assert!(table.lookup(None, "Stop").is_none());
    }
}
