pub mod background;
pub mod beacon;
pub mod compose;
pub mod config;
#[cfg(unix)]
pub mod daemon;
pub mod dom;
pub mod domain;
pub mod identity;
pub mod ipc;
pub mod page;
pub mod reconcile;
pub mod remote;
pub mod store;
pub mod text;
