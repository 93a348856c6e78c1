use serde::{Deserialize, Serialize};

/// The subscribe request sent over the stream socket, and the shape the
/// server's acknowledgment comes back in.
///
/// A subscription is identified by its ordered list of stream keys
/// (e.g. `"trades/XYZ"`). The server echoes the accepted list back; the
/// handshake succeeds only if the echo matches the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeMessage {
    /// Ordered stream keys this subscription covers.
    pub streams: Vec<String>,
}

impl SubscribeMessage {
    /// Build a subscribe message from anything yielding stream keys.
    pub fn new<I, S>(streams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            streams: streams.into_iter().map(Into::into).collect(),
        }
    }
}

/// One streamed update, decoded from a single data frame.
///
/// `key` names the series bucket the update belongs to; `data` is the
/// server's payload body, kept as a dynamic msgpack value since its
/// layout varies per stream and is not interpreted by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub key: String,
    pub data: rmpv::Value,
}

/// Compare two stream lists the way the server does during the
/// handshake: same length, same order, per-element case-insensitive.
pub fn streams_equal<A, B>(a: &[A], b: &[B]) -> bool
where
    A: AsRef<str>,
    B: AsRef<str>,
{
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.as_ref().to_lowercase() == y.as_ref().to_lowercase())
}

/// Encode a value as msgpack with string-keyed maps for structs, the
/// layout the service speaks on both the RPC and stream paths.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(value)
}

/// Decode a msgpack buffer into a typed value.
pub fn decode<'a, T: Deserialize<'a>>(buf: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(buf)
}
