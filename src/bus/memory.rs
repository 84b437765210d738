//! In-process bus.
//!
//! [`MemoryBus`] implements [`Transport`] without any socket: method calls
//! are answered by registered handlers and notifications are emitted
//! directly into the raw signal channel. Like a real bus, a notification is
//! only delivered while at least one match rule for it is registered, so a
//! subscriber that registers too late misses it.

use super::{RawSignal, Transport};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use vmorch_protocol::{decode_message, encode_message, MatchRule, Signal};

type Handler = dyn Fn(&[u8], &MemoryBus) -> Result<Vec<u8>> + Send + Sync;

/// In-process bus with scriptable method handlers.
pub struct MemoryBus {
    handlers: Mutex<HashMap<(String, String), Arc<Handler>>>,
    matches: Mutex<HashMap<MatchRule, usize>>,
    calls: Mutex<Vec<String>>,
    signals: Mutex<Option<mpsc::UnboundedSender<RawSignal>>>,
    fail_add_match: AtomicBool,
}

impl MemoryBus {
    /// Create a bus and the raw signal channel it delivers into.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RawSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Self {
            handlers: Mutex::new(HashMap::new()),
            matches: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            signals: Mutex::new(Some(tx)),
            fail_add_match: AtomicBool::new(false),
        };
        (Arc::new(bus), rx)
    }

    /// Answer `destination.method` with a typed handler.
    pub fn handle<Req, Resp, F>(&self, destination: &str, method: &str, handler: F)
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        F: Fn(Req, &MemoryBus) -> Resp + Send + Sync + 'static,
    {
        let name = method.to_string();
        self.handle_raw(destination, method, move |body, bus| {
            let req = decode_message(body).map_err(|e| {
                Error::transport(format!("decode {} request", name), e.to_string())
            })?;
            encode_message(&handler(req, bus))
                .map_err(|e| Error::transport(format!("encode {} reply", name), e.to_string()))
        });
    }

    /// Answer `destination.method` with a raw payload handler.
    pub fn handle_raw<F>(&self, destination: &str, method: &str, handler: F)
    where
        F: Fn(&[u8], &MemoryBus) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.handlers.lock().insert(
            (destination.to_string(), method.to_string()),
            Arc::new(handler),
        );
    }

    /// Emit a typed notification. Returns whether anyone was listening.
    pub fn emit<S: Signal>(&self, signal: S) -> bool {
        match signal.into_notification().encode() {
            Ok(payload) => self.emit_raw(S::NAME, payload),
            Err(e) => {
                tracing::warn!(signal = S::NAME, error = %e, "failed to encode notification");
                false
            }
        }
    }

    /// Emit a raw payload under a signal name. Returns whether anyone was listening.
    pub fn emit_raw(&self, member: &str, payload: Vec<u8>) -> bool {
        let rule = MatchRule::container_signal(member);
        if self.matches.lock().get(&rule).copied().unwrap_or(0) == 0 {
            tracing::trace!(signal = member, "no match rule registered, dropping notification");
            return false;
        }

        let signals = self.signals.lock();
        match signals.as_ref() {
            Some(tx) => tx
                .send(RawSignal {
                    interface: rule.interface,
                    path: rule.path,
                    member: rule.member,
                    payload,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Close the notification channel, as a dropped bus connection would.
    pub fn disconnect(&self) {
        self.signals.lock().take();
    }

    /// Make subsequent `add_match` calls fail.
    pub fn fail_add_match(&self, fail: bool) {
        self.fail_add_match.store(fail, Ordering::SeqCst);
    }

    /// Total number of registered match rules (counting duplicates).
    pub fn active_matches(&self) -> usize {
        self.matches.lock().values().sum()
    }

    /// Number of registrations for one signal.
    pub fn match_count(&self, member: &str) -> usize {
        self.matches
            .lock()
            .get(&MatchRule::container_signal(member))
            .copied()
            .unwrap_or(0)
    }

    /// Methods called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn call(&self, destination: &str, method: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        self.calls.lock().push(method.to_string());

        let handler = self
            .handlers
            .lock()
            .get(&(destination.to_string(), method.to_string()))
            .cloned();

        match handler {
            Some(handler) => handler(&body, self),
            None => Err(Error::transport(
                format!("call {}.{}", destination, method),
                "no such method",
            )),
        }
    }

    async fn add_match(&self, rule: &MatchRule) -> Result<()> {
        if self.fail_add_match.load(Ordering::SeqCst) {
            return Err(Error::transport("add match", format!("rejected rule {}", rule)));
        }
        *self.matches.lock().entry(rule.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn remove_match(&self, rule: &MatchRule) -> Result<()> {
        let mut matches = self.matches.lock();
        match matches.get_mut(rule) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                matches.remove(rule);
                Ok(())
            }
            None => Err(Error::transport(
                "remove match",
                format!("rule not registered: {}", rule),
            )),
        }
    }
}
