//! The two periodic loops that bring remote open state back to the user:
//! status polling in the background and tick annotation on the page.

pub mod annotate;
pub mod poller;
