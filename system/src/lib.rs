pub extern crate bincode;
pub extern crate chrono;
pub extern crate serde;
pub extern crate serde_json;
pub extern crate uuid;

mod action;
mod action_log;
mod board_document;
mod client_replica_document;
mod message;
mod object;
mod reconciler;
mod snapshot;
mod traits;
mod types;

pub use action::*;
pub use action_log::*;
pub use board_document::*;
pub use client_replica_document::*;
pub use message::*;
pub use object::*;
pub use reconciler::*;
pub use snapshot::*;
pub use traits::*;
pub use types::*;
