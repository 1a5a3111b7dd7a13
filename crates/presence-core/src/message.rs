//! Wire format: addressed messages with ordered, typed arguments.
//!
//! Every datagram carries one [`Message`]: a `/`-separated address and a list
//! of self-describing [`Arg`]s, serialized with bincode. Addresses under
//! `/<prefix>/` belong to the discovery protocol; everything else is
//! application traffic handed to the relay.

use crate::relay::RelayedMessage;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Address prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "ofxSearchNetworkNode";

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Missing argument {index}")]
    MissingArgument { index: usize },

    #[error("Argument {index} is not {expected}")]
    ArgumentType { index: usize, expected: &'static str },

    #[error("Invalid list length {0}")]
    InvalidLength(i32),

    #[error("Unknown protocol method: {0:?}")]
    UnknownMethod(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// A single typed argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Str(String),
    Bool(bool),
    Blob(Vec<u8>),
}

impl Arg {
    fn type_name(&self) -> &'static str {
        match self {
            Arg::Int32(_) => "int32",
            Arg::Int64(_) => "int64",
            Arg::Float32(_) => "float32",
            Arg::Float64(_) => "float64",
            Arg::Str(_) => "string",
            Arg::Bool(_) => "bool",
            Arg::Blob(_) => "blob",
        }
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int32(v)
    }
}

impl From<f32> for Arg {
    fn from(v: f32) -> Self {
        Arg::Float32(v)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Str(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Str(v)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(v: Vec<u8>) -> Self {
        Arg::Blob(v)
    }
}

/// An addressed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub address: String,
    pub args: Vec<Arg>,
}

impl Message {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument (builder style).
    pub fn with_arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn push(&mut self, arg: impl Into<Arg>) {
        self.args.push(arg.into());
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| CodecError::Decode(e.to_string()))
    }

    pub fn arg(&self, index: usize) -> Result<&Arg> {
        self.args
            .get(index)
            .ok_or(CodecError::MissingArgument { index })
    }

    pub fn int32(&self, index: usize) -> Result<i32> {
        match self.arg(index)? {
            Arg::Int32(v) => Ok(*v),
            other => Err(type_error(index, other, "int32")),
        }
    }

    pub fn float32(&self, index: usize) -> Result<f32> {
        match self.arg(index)? {
            Arg::Float32(v) => Ok(*v),
            other => Err(type_error(index, other, "float32")),
        }
    }

    pub fn string(&self, index: usize) -> Result<&str> {
        match self.arg(index)? {
            Arg::Str(v) => Ok(v),
            other => Err(type_error(index, other, "string")),
        }
    }

    pub fn bool(&self, index: usize) -> Result<bool> {
        match self.arg(index)? {
            Arg::Bool(v) => Ok(*v),
            other => Err(type_error(index, other, "bool")),
        }
    }

    pub fn blob(&self, index: usize) -> Result<&[u8]> {
        match self.arg(index)? {
            Arg::Blob(v) => Ok(v),
            other => Err(type_error(index, other, "blob")),
        }
    }
}

fn type_error(index: usize, found: &Arg, expected: &'static str) -> CodecError {
    tracing::trace!("argument {} is {}, expected {}", index, found.type_name(), expected);
    CodecError::ArgumentType { index, expected }
}

/// Sequential reader over a message's arguments.
struct ArgReader<'a> {
    message: &'a Message,
    pos: usize,
}

impl<'a> ArgReader<'a> {
    fn new(message: &'a Message) -> Self {
        Self { message, pos: 0 }
    }

    fn next_index(&mut self) -> usize {
        let i = self.pos;
        self.pos += 1;
        i
    }

    fn int32(&mut self) -> Result<i32> {
        let i = self.next_index();
        self.message.int32(i)
    }

    fn float32(&mut self) -> Result<f32> {
        let i = self.next_index();
        self.message.float32(i)
    }

    fn bool(&mut self) -> Result<bool> {
        let i = self.next_index();
        self.message.bool(i)
    }

    fn string(&mut self) -> Result<String> {
        let i = self.next_index();
        self.message.string(i).map(str::to_string)
    }

    /// Count-prefixed string list.
    fn string_list(&mut self) -> Result<Vec<String>> {
        let count = self.int32()?;
        if count < 0 {
            return Err(CodecError::InvalidLength(count));
        }
        // Bound by what the message can actually hold
        let remaining = self.message.args.len().saturating_sub(self.pos);
        if count as usize > remaining {
            return Err(CodecError::InvalidLength(count));
        }
        (0..count).map(|_| self.string()).collect()
    }
}

fn push_string_list(message: &mut Message, list: &[String]) {
    message.push(list.len() as i32);
    for item in list {
        message.push(item.as_str());
    }
}

/// Fields every node advertises about itself in a Request or Response.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Secret mode hash, `0` when not attempted
    pub hash: u32,
    /// Sender's display name
    pub name: String,
    /// Sender's own groups
    pub groups: Vec<String>,
    /// Whether the sender wants us to heartbeat it
    pub heartbeat_required: bool,
    /// How often the sender wants heartbeats, in seconds
    pub heartbeat_interval: f32,
}

impl Advertisement {
    fn write(&self, message: &mut Message) {
        message.push(self.hash as i32);
        message.push(self.name.as_str());
        push_string_list(message, &self.groups);
        message.push(self.heartbeat_required);
        message.push(self.heartbeat_interval);
    }

    fn read(reader: &mut ArgReader<'_>) -> Result<Self> {
        Ok(Self {
            hash: reader.int32()? as u32,
            name: reader.string()?,
            groups: reader.string_list()?,
            heartbeat_required: reader.bool()?,
            heartbeat_interval: reader.float32()?,
        })
    }
}

/// A classified inbound or outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    /// Discovery request, usually broadcast
    Request {
        /// Groups the requester is looking for
        filter_groups: Vec<String>,
        advertisement: Advertisement,
    },
    /// Unicast answer to an accepted Request
    Response(Advertisement),
    /// Sender is leaving
    Disconnect,
    /// Liveness signal
    Heartbeat,
    /// Anything outside the protocol namespace
    Application(RelayedMessage),
}

/// The protocol's reserved address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `/<prefix>/<method>`
    pub fn address(&self, method: &str) -> String {
        format!("/{}/{}", self.prefix, method)
    }

    /// Method name if `address` is inside the namespace.
    ///
    /// `/<prefix>` alone yields an empty method.
    fn method<'a>(&self, address: &'a str) -> Option<&'a str> {
        let mut parts = address.split('/');
        if parts.next() != Some("") || parts.next() != Some(self.prefix.as_str()) {
            return None;
        }
        Some(parts.next().unwrap_or(""))
    }

    pub fn contains(&self, address: &str) -> bool {
        self.method(address).is_some()
    }

    /// Build the wire message for a protocol message.
    ///
    /// Application messages are sent as-is.
    pub fn encode(&self, message: &ProtocolMessage) -> Message {
        match message {
            ProtocolMessage::Request {
                filter_groups,
                advertisement,
            } => {
                let mut msg = Message::new(self.address("request"));
                push_string_list(&mut msg, filter_groups);
                advertisement.write(&mut msg);
                msg
            }
            ProtocolMessage::Response(advertisement) => {
                let mut msg = Message::new(self.address("response"));
                advertisement.write(&mut msg);
                msg
            }
            ProtocolMessage::Disconnect => Message::new(self.address("disconnect")),
            ProtocolMessage::Heartbeat => Message::new(self.address("heartbeat")),
            ProtocolMessage::Application(relayed) => Message {
                address: relayed.address.clone(),
                args: relayed.args.clone(),
            },
        }
    }

    /// Classify a received message.
    pub fn decode(&self, message: Message, sender: Ipv4Addr) -> Result<ProtocolMessage> {
        let Some(method) = self.method(&message.address) else {
            return Ok(ProtocolMessage::Application(RelayedMessage {
                address: message.address,
                args: message.args,
                sender,
            }));
        };

        let mut reader = ArgReader::new(&message);
        match method {
            "request" => {
                let filter_groups = reader.string_list()?;
                let advertisement = Advertisement::read(&mut reader)?;
                Ok(ProtocolMessage::Request {
                    filter_groups,
                    advertisement,
                })
            }
            "response" => Ok(ProtocolMessage::Response(Advertisement::read(&mut reader)?)),
            "disconnect" => Ok(ProtocolMessage::Disconnect),
            "heartbeat" => Ok(ProtocolMessage::Heartbeat),
            other => Err(CodecError::UnknownMethod(other.to_string())),
        }
    }
}
