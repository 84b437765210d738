//! Waiting for typed notifications.
//!
//! [`wait_for_signal`] turns a [`Subscription`] into a typed wait bounded by
//! a [`Context`]. [`Pending`] is the two-phase form used by every
//! asynchronous operation: register before issuing the request, then wait
//! for a record carrying the right correlation key.

use super::dispatcher::{Delivery, Dispatcher, Subscription};
use crate::context::Context;
use crate::error::{Error, Result};
use std::marker::PhantomData;
use vmorch_protocol::{CorrelationKey, Signal};

/// Wait for the next notification of type `S` on `subscription`.
///
/// With a `filter`, deliveries for other signals are left queued on the
/// subscription. Without one, every delivery must be an `S`. A payload that
/// fails to decode is an error immediately and is not retried.
pub async fn wait_for_signal<S: Signal>(
    ctx: &Context,
    subscription: &mut Subscription,
    filter: Option<&str>,
) -> Result<S> {
    ctx.run(S::NAME, async {
        let delivery = subscription.next_delivery(filter).await.ok_or_else(|| {
            Error::transport(format!("wait for {}", S::NAME), "notification stream closed")
        })?;

        match delivery {
            Delivery::Notification(notification) => {
                let signal = notification.signal();
                S::from_notification(notification).ok_or_else(|| {
                    Error::decode(S::NAME, format!("unexpected {} notification", signal))
                })
            }
            Delivery::DecodeFailed { signal, reason } => Err(Error::decode(signal, reason)),
        }
    })
    .await
}

/// A registered wait for notifications of type `S` with one correlation key.
///
/// Registration happens when the value is created, so it must be created
/// before the request that triggers the notification is issued.
pub struct Pending<S: Signal> {
    key: CorrelationKey,
    subscription: Subscription,
    _signal: PhantomData<fn() -> S>,
}

impl<S: Signal> Pending<S> {
    /// Register interest in `S` notifications for `key`.
    pub async fn register(dispatcher: &Dispatcher, key: CorrelationKey) -> Result<Self> {
        let subscription = dispatcher.subscribe(&[S::NAME], Some(key.clone())).await?;
        Ok(Self {
            key,
            subscription,
            _signal: PhantomData,
        })
    }

    /// Correlation key this wait is scoped to.
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Next record carrying this wait's key.
    pub async fn next(&mut self, ctx: &Context) -> Result<S> {
        loop {
            let signal: S = wait_for_signal(ctx, &mut self.subscription, Some(S::NAME)).await?;
            if signal.key() == &self.key {
                return Ok(signal);
            }
            tracing::trace!(
                signal = S::NAME,
                expected = %self.key,
                got = %signal.key(),
                "skipping notification for another key"
            );
        }
    }

    /// First record with this wait's key that `accept` takes.
    ///
    /// `accept` returns `Some` to finish the wait and `None` to keep waiting.
    pub async fn wait_until<T, F>(&mut self, ctx: &Context, mut accept: F) -> Result<T>
    where
        F: FnMut(S) -> Option<Result<T>>,
    {
        loop {
            let signal = self.next(ctx).await?;
            if let Some(result) = accept(signal) {
                return result;
            }
        }
    }

    /// Release the registration.
    pub async fn close(self) -> Result<()> {
        self.subscription.close().await
    }
}
