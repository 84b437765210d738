//! Signal correlation.
//!
//! Asynchronous operations are requested with a method call and complete
//! when a notification carrying the caller's correlation key arrives. The
//! [`Dispatcher`] owns the notification stream and fans it out; the
//! correlator functions turn deliveries into typed, deadline-bounded waits.

pub mod correlator;
pub mod dispatcher;

pub use correlator::{wait_for_signal, Pending};
pub use dispatcher::{Delivery, Dispatcher, Subscription};
