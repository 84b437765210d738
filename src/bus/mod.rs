//! Message bus transport.
//!
//! The orchestration client talks to its collaborators through a bus that
//! offers two channels:
//! - method calls: a request payload goes to a named service, one reply
//!   payload comes back
//! - notifications: raw signal payloads delivered to every connection that
//!   registered a matching [`MatchRule`]
//!
//! [`Transport`] abstracts the method-call and match-rule side. Raw
//! notifications are handed out separately as a channel of [`RawSignal`]s,
//! consumed by a single [`crate::signal::Dispatcher`].

pub mod memory;
pub mod socket;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use vmorch_protocol::{decode_message, encode_message, MatchRule};

pub use memory::MemoryBus;
pub use socket::SocketTransport;

/// A notification as delivered by the bus, before decoding.
#[derive(Debug, Clone)]
pub struct RawSignal {
    /// Interface emitting the signal.
    pub interface: String,
    /// Object path emitting the signal.
    pub path: String,
    /// Signal name.
    pub member: String,
    /// Length-prefixed payload.
    pub payload: Vec<u8>,
}

/// Method-call and match-rule side of the bus.
///
/// Match rules are reference counted by the bus: every successful
/// `add_match` must be paired with exactly one `remove_match`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Call a method and return the raw reply payload.
    async fn call(&self, destination: &str, method: &str, body: Vec<u8>) -> Result<Vec<u8>>;

    /// Register a match rule so matching notifications are delivered.
    async fn add_match(&self, rule: &MatchRule) -> Result<()>;

    /// Release one registration of a match rule.
    async fn remove_match(&self, rule: &MatchRule) -> Result<()>;
}

/// Call a method with a typed request and decode the typed reply.
pub async fn call_method<Req, Resp>(
    transport: &dyn Transport,
    destination: &str,
    method: &str,
    request: &Req,
) -> Result<Resp>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let body = encode_message(request)
        .map_err(|e| Error::transport(format!("encode {} request", method), e.to_string()))?;

    tracing::debug!(destination, method, "calling method");
    let reply = transport.call(destination, method, body).await?;

    decode_message(&reply)
        .map_err(|e| Error::transport(format!("decode {} reply", method), e.to_string()))
}
