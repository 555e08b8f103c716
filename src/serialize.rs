//! Graph Serializer
//!
//! Encodes a [`Value`] graph as JSON nodes. The first chunk of a stream holds
//! the root; every later chunk settles one deferred value announced earlier.
//! Shared and deferred ids are scoped to one stream.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Map, Number};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::body::Body;
use crate::error::DecodeError;
use crate::framing::{encode_chunk, ChunkReader};
use crate::value::{Deferred, Settlement, StableReference, Value};

type Node = serde_json::Value;

// ═══════════════════════════════════════════════════════════════════════════════
// REFERENCE TABLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Values registered under a stable id. A reference node on the wire carries
/// only the id; decoding resolves it here.
#[derive(Debug, Default)]
pub struct References {
    table: RwLock<HashMap<String, Value>>,
}

impl References {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` under `id` and returns the reference to it.
    pub fn create(&self, id: impl Into<String>, value: Value) -> Value {
        let id = id.into();
        self.table.write().insert(id.clone(), value.clone());
        Value::reference(id, value)
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.table.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENCODING
// ═══════════════════════════════════════════════════════════════════════════════

fn tagged(tag: &str) -> Map<String, Node> {
    let mut map = Map::new();
    map.insert("t".to_string(), Node::String(tag.to_string()));
    map
}

#[derive(Default)]
pub struct Serializer {
    shared: HashMap<usize, u32>,
    /// Keeps shared nodes alive so their addresses stay unique for the
    /// lifetime of the stream.
    keepalive: Vec<Arc<Value>>,
    deferred: HashMap<usize, u32>,
    /// Same for deferred handles, which outlive `take_pending`.
    deferred_keepalive: Vec<Deferred>,
    pending: Vec<(u32, Deferred)>,
    next_shared: u32,
    next_deferred: u32,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&mut self, value: &Value) -> Node {
        match value {
            Value::Undefined => Node::Object(tagged("u")),
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(*b),
            Value::Number(n) => match Number::from_f64(*n) {
                Some(number) => Node::Number(number),
                None => {
                    let mut map = tagged("n");
                    let text = if n.is_nan() {
                        "NaN"
                    } else if *n > 0.0 {
                        "Infinity"
                    } else {
                        "-Infinity"
                    };
                    map.insert("v".to_string(), Node::String(text.to_string()));
                    Node::Object(map)
                }
            },
            Value::BigInt(digits) => {
                let mut map = tagged("b");
                map.insert("v".to_string(), Node::String(digits.clone()));
                Node::Object(map)
            }
            Value::String(s) => Node::String(s.clone()),
            Value::Array(items) => Node::Array(items.iter().map(|item| self.encode(item)).collect()),
            Value::Object(entries) => {
                let mut map = tagged("o");
                let encoded = entries
                    .iter()
                    .map(|(key, value)| Node::Array(vec![Node::String(key.clone()), self.encode(value)]))
                    .collect();
                map.insert("v".to_string(), Node::Array(encoded));
                Node::Object(map)
            }
            Value::Shared(inner) => {
                let addr = Arc::as_ptr(inner) as usize;
                if let Some(id) = self.shared.get(&addr) {
                    let mut map = tagged("r");
                    map.insert("i".to_string(), json!(id));
                    return Node::Object(map);
                }
                let id = self.next_shared;
                self.next_shared += 1;
                self.shared.insert(addr, id);
                self.keepalive.push(inner.clone());
                let mut map = tagged("s");
                map.insert("i".to_string(), json!(id));
                map.insert("v".to_string(), self.encode(inner));
                Node::Object(map)
            }
            Value::Error { name, message } => {
                let mut map = tagged("e");
                map.insert("name".to_string(), Node::String(name.clone()));
                map.insert("message".to_string(), Node::String(message.clone()));
                Node::Object(map)
            }
            Value::Reference(reference) => {
                let mut map = tagged("x");
                map.insert("id".to_string(), Node::String(reference.id.clone()));
                Node::Object(map)
            }
            Value::Deferred(deferred) => {
                let id = match self.deferred.get(&deferred.addr()) {
                    Some(id) => *id,
                    None => {
                        let id = self.next_deferred;
                        self.next_deferred += 1;
                        self.deferred.insert(deferred.addr(), id);
                        self.deferred_keepalive.push(deferred.clone());
                        self.pending.push((id, deferred.clone()));
                        id
                    }
                };
                let mut map = tagged("d");
                map.insert("i".to_string(), json!(id));
                Node::Object(map)
            }
        }
    }

    /// Deferred values encoded since the last call.
    pub fn take_pending(&mut self) -> Vec<(u32, Deferred)> {
        std::mem::take(&mut self.pending)
    }

    /// The follow-up message settling deferred value `id`.
    pub fn settlement(&mut self, id: u32, settlement: &Settlement) -> Node {
        let (tag, value) = match settlement {
            Ok(value) => ("resolve", value),
            Err(error) => ("reject", error),
        };
        let mut map = tagged(tag);
        map.insert("i".to_string(), json!(id));
        map.insert("v".to_string(), self.encode(value));
        Node::Object(map)
    }
}

fn frame(node: &Node) -> Bytes {
    encode_chunk(node.to_string().as_bytes())
}

/// Streams `value` as framed chunks: the root first, then one chunk per
/// deferred value in settlement order.
pub fn serialize_stream(value: Value) -> BoxStream<'static, Bytes> {
    Box::pin(async_stream::stream! {
        let mut serializer = Serializer::new();
        let root = serializer.encode(&value);
        yield frame(&root);

        let mut pending: FuturesUnordered<BoxFuture<'static, (u32, Settlement)>> = FuturesUnordered::new();
        for (id, deferred) in serializer.take_pending() {
            pending.push(async move { (id, deferred.settle().await) }.boxed());
        }
        while let Some((id, settlement)) = pending.next().await {
            let message = serializer.settlement(id, &settlement);
            for (id, deferred) in serializer.take_pending() {
                pending.push(async move { (id, deferred.settle().await) }.boxed());
            }
            yield frame(&message);
        }
    })
}

/// [`serialize_stream`] as a body.
pub fn serialize_body(value: Value) -> Body {
    Body::from_stream(serialize_stream(value).map(Ok::<_, io::Error>).boxed())
}

// ═══════════════════════════════════════════════════════════════════════════════
// DECODING
// ═══════════════════════════════════════════════════════════════════════════════

fn tag_of(map: &Map<String, Node>) -> Option<&str> {
    map.get("t").and_then(Node::as_str)
}

fn index_of(map: &Map<String, Node>) -> Result<u32, DecodeError> {
    map.get("i")
        .and_then(Node::as_u64)
        .map(|i| i as u32)
        .ok_or_else(|| DecodeError::InvalidNode("missing index".to_string()))
}

fn string_field(map: &Map<String, Node>, key: &str) -> Result<String, DecodeError> {
    map.get(key)
        .and_then(Node::as_str)
        .map(str::to_string)
        .ok_or_else(|| DecodeError::InvalidNode(format!("missing {:?}", key)))
}

pub struct Deserializer {
    references: Arc<References>,
    shared: HashMap<u32, Arc<Value>>,
    deferred: HashMap<u32, Deferred>,
    senders: HashMap<u32, oneshot::Sender<Settlement>>,
    root_seen: bool,
}

impl Deserializer {
    pub fn new(references: Arc<References>) -> Self {
        Deserializer {
            references,
            shared: HashMap::new(),
            deferred: HashMap::new(),
            senders: HashMap::new(),
            root_seen: false,
        }
    }

    pub fn decode(&mut self, node: &Node) -> Result<Value, DecodeError> {
        match node {
            Node::Null => Ok(Value::Null),
            Node::Bool(b) => Ok(Value::Bool(*b)),
            Node::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| DecodeError::InvalidNode(n.to_string())),
            Node::String(s) => Ok(Value::String(s.clone())),
            Node::Array(items) => items
                .iter()
                .map(|item| self.decode(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Node::Object(map) => self.decode_tagged(map),
        }
    }

    fn decode_tagged(&mut self, map: &Map<String, Node>) -> Result<Value, DecodeError> {
        let tag = tag_of(map).ok_or_else(|| DecodeError::InvalidNode("untagged object".to_string()))?;
        match tag {
            "u" => Ok(Value::Undefined),
            "n" => match string_field(map, "v")?.as_str() {
                "NaN" => Ok(Value::Number(f64::NAN)),
                "Infinity" => Ok(Value::Number(f64::INFINITY)),
                "-Infinity" => Ok(Value::Number(f64::NEG_INFINITY)),
                other => Err(DecodeError::InvalidNode(format!("number {:?}", other))),
            },
            "b" => Ok(Value::BigInt(string_field(map, "v")?)),
            "o" => {
                let entries = map
                    .get("v")
                    .and_then(Node::as_array)
                    .ok_or_else(|| DecodeError::InvalidNode("object without entries".to_string()))?;
                let mut decoded = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry.as_array().map(Vec::as_slice) {
                        Some([Node::String(key), value]) => decoded.push((key.clone(), self.decode(value)?)),
                        _ => return Err(DecodeError::InvalidNode("malformed object entry".to_string())),
                    }
                }
                Ok(Value::Object(decoded))
            }
            "s" => {
                let id = index_of(map)?;
                let inner = map
                    .get("v")
                    .ok_or_else(|| DecodeError::InvalidNode("shared node without value".to_string()))?;
                let value = Arc::new(self.decode(inner)?);
                self.shared.insert(id, value.clone());
                Ok(Value::Shared(value))
            }
            "r" => {
                let id = index_of(map)?;
                self.shared
                    .get(&id)
                    .cloned()
                    .map(Value::Shared)
                    .ok_or(DecodeError::DanglingShared(id))
            }
            "e" => Ok(Value::error(string_field(map, "name")?, string_field(map, "message")?)),
            "x" => {
                let id = string_field(map, "id")?;
                let value = self
                    .references
                    .get(&id)
                    .ok_or_else(|| DecodeError::UnknownReference(id.clone()))?;
                Ok(Value::Reference(Arc::new(StableReference { id, value })))
            }
            "d" => {
                let id = index_of(map)?;
                if let Some(deferred) = self.deferred.get(&id) {
                    return Ok(Value::Deferred(deferred.clone()));
                }
                let (sender, receiver) = oneshot::channel::<Settlement>();
                let deferred = Deferred::new(async move {
                    receiver.await.unwrap_or_else(|_| {
                        Err(Value::error("Error", "stream closed before the value settled"))
                    })
                });
                self.senders.insert(id, sender);
                self.deferred.insert(id, deferred.clone());
                Ok(Value::Deferred(deferred))
            }
            other => Err(DecodeError::UnknownTag(other.to_string())),
        }
    }

    /// Applies one chunk payload. Returns the root value for the first chunk.
    pub fn read_chunk(&mut self, payload: &[u8]) -> Result<Option<Value>, DecodeError> {
        let node: Node = serde_json::from_slice(payload)?;
        if !self.root_seen {
            self.root_seen = true;
            return self.decode(&node).map(Some);
        }

        let Node::Object(map) = &node else {
            return Err(DecodeError::InvalidNode("expected a settlement message".to_string()));
        };
        let id = index_of(map)?;
        let value = map
            .get("v")
            .ok_or_else(|| DecodeError::InvalidNode("settlement without value".to_string()))?;
        let settlement = match tag_of(map) {
            Some("resolve") => Ok(self.decode(value)?),
            Some("reject") => Err(self.decode(value)?),
            Some(other) => return Err(DecodeError::UnknownTag(other.to_string())),
            None => return Err(DecodeError::InvalidNode("untagged message".to_string())),
        };
        let sender = self.senders.remove(&id).ok_or(DecodeError::DanglingDeferred(id))?;
        // The receiving side may have dropped the value already.
        let _ = sender.send(settlement);
        Ok(None)
    }

    /// True once every announced deferred value has settled.
    pub fn is_settled(&self) -> bool {
        self.senders.is_empty()
    }
}

/// Decodes the root value of a complete chunked payload, applying every
/// follow-up chunk before returning.
pub fn decode_all(data: &[u8], references: Arc<References>) -> Result<Value, DecodeError> {
    let mut deserializer = Deserializer::new(references);
    let mut root = None;
    for chunk in crate::framing::decode_chunks(data)? {
        if let Some(value) = deserializer.read_chunk(&chunk)? {
            root = Some(value);
        }
    }
    root.ok_or(DecodeError::Empty)
}

/// Reads `body` until the root value is complete and returns it. Remaining
/// chunks are drained by a background task that settles deferred values.
pub async fn decode_stream(body: Body, references: Arc<References>) -> Result<Value, DecodeError> {
    let mut stream = body.into_stream();
    let mut reader = ChunkReader::new();
    let mut deserializer = Deserializer::new(references);

    let root = loop {
        if let Some(chunk) = reader.next_chunk()? {
            if let Some(root) = deserializer.read_chunk(&chunk)? {
                break root;
            }
            continue;
        }
        match stream.next().await {
            Some(Ok(data)) => reader.push(&data),
            Some(Err(error)) => return Err(DecodeError::Stream(error.to_string())),
            None => {
                reader.finish()?;
                return Err(DecodeError::Empty);
            }
        }
    };

    if deserializer.is_settled() && reader.is_empty() {
        return Ok(root);
    }

    tokio::spawn(async move {
        loop {
            match reader.next_chunk() {
                Ok(Some(chunk)) => {
                    if let Err(error) = deserializer.read_chunk(&chunk) {
                        debug!(%error, "dropping malformed follow-up chunk");
                        return;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(error) => {
                    debug!(%error, "stream framing failed");
                    return;
                }
            }
            if deserializer.is_settled() {
                return;
            }
            match stream.next().await {
                Some(Ok(data)) => reader.push(&data),
                Some(Err(error)) => {
                    debug!(%error, "stream failed while draining");
                    return;
                }
                None => {
                    if let Err(error) = reader.finish() {
                        debug!(%error, "stream ended inside a chunk");
                    }
                    return;
                }
            }
        }
    });
    Ok(root)
}
