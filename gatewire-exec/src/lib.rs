//! Gateways, channels and groups: the execution layer of gatewire.
//!
//! A [`Group`] turns endpoint specifications ([`XSpec`]) into bootstrapped
//! [`Gateway`]s over subprocess pipes, ssh, or TCP sockets. A gateway
//! multiplexes any number of [`Channel`]s over its single byte stream and
//! schedules execution requests on the worker's [`OpRegistry`]. The wire
//! format itself lives in `gatewire-proto`.
//!
//! The worker ends of those connections are served by [`serve_stdio`],
//! [`serve_connection`] and [`listen`], typically through the
//! `gatewire-worker` binary.

#![deny(missing_docs)]

#[macro_use]
extern crate log;
#[macro_use(defer)]
extern crate scopeguard;

mod channel;
mod execmodel;
mod gateway;
mod group;
mod ops;
mod serve;
mod trace;
mod transport;
mod xspec;

pub use channel::{
    Channel, ChannelError, ChannelReadFile, ChannelWriteFile, Item, RemoteError,
};
pub use execmodel::{ExecModel, UnknownExecModel, MAIN_THREAD_ONLY_DEADLOCK};
pub use gateway::{ExecCall, Gateway, HostNotFound, RemoteInfo, RemoteStatus};
pub use group::{Group, MultiChannel};
pub use ops::{ExecContext, OpRegistry};
pub use serve::{
    listen, serve_connection, serve_stdio, serve_stdio_with, serve_transport, ServeDefaults,
};
pub use trace::{init_from_env as init_debug_trace, DEBUG_ENV};
pub use transport::{Transport, TransportError};
pub use xspec::{SpecValue, XSpec, XSpecError};
