//! Gateway between a host's device registry and DomoCAN nodes on a SocketCAN
//! bus.
//!
//! Nodes are addressed through a packed 32-bit extended identifier
//! ([`CanIdentifier`]). A background [`Dispatcher`] listens for coin and
//! activity events and applies them to the [`Registry`], while commands such
//! as releasing a coin go through a one-shot [`CommandExchange`] that waits
//! for the node's acknowledge.

mod admin;
mod bus;
mod command;
mod config;
mod device;
mod dispatcher;
mod event;
mod frame;
mod gateway;
mod handlers;
mod identifier;
mod registry;

#[cfg(target_os = "linux")]
mod socket;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use admin::*;
pub use bus::*;
pub use command::*;
pub use config::*;
pub use device::*;
pub use dispatcher::*;
pub use event::*;
pub use frame::*;
pub use gateway::*;
pub use handlers::*;
pub use identifier::*;
pub use registry::*;

#[cfg(target_os = "linux")]
pub use socket::*;

pub use embedded_can::{ExtendedId, Id, StandardId};
