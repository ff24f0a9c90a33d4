//! gatewire: a zero-install, multi-endpoint code-execution fabric.
//!
//! A controlling process (the master) bootstraps worker endpoints over
//! subprocess pipes, ssh, or TCP sockets, and exchanges work with them over
//! bidirectional, in-order, multiplexed channels. Workers are addressed by
//! endpoint specification strings:
//!
//! ```no_run
//! use gatewire::ExecCall;
//!
//! let gw = gatewire::make_gateway("popen//id=local").unwrap();
//! let channel = gw.remote_exec(ExecCall::call("echo")).unwrap();
//! channel.send(21i64).unwrap();
//! let item = channel.receive(None).unwrap();
//! # drop(item);
//! ```
//!
//! The building blocks live in two member crates and are re-exported here:
//! `gatewire-proto` (value codec, framing) and `gatewire-exec` (transports,
//! channels, gateways, groups, the worker serve loops).

#![deny(missing_docs)]

#[macro_use]
extern crate lazy_static;

pub use gatewire_exec::{
    init_debug_trace, listen, serve_connection, serve_stdio, serve_stdio_with, serve_transport,
    Channel, ChannelError, ChannelReadFile, ChannelWriteFile, ExecCall, ExecContext, ExecModel,
    Gateway, Group, HostNotFound, Item, MultiChannel, OpRegistry, RemoteError, RemoteInfo,
    RemoteStatus, ServeDefaults, SpecValue, Transport, TransportError, UnknownExecModel, XSpec,
    XSpecError, DEBUG_ENV, MAIN_THREAD_ONLY_DEADLOCK,
};
pub use gatewire_proto::{
    dump, load, load_with, DumpError, Frame, FrameError, LoadError, MsgCode, StrCoercion, Value,
    FORMAT_VERSION,
};

lazy_static! {
    static ref DEFAULT_GROUP: Group = Group::new();
}

/// The lazily-initialised, process-wide default [`Group`].
///
/// Terminate it explicitly when the process is done with its gateways;
/// there is no automatic teardown beyond the group's own drop behaviour.
pub fn default_group() -> Group {
    DEFAULT_GROUP.clone()
}

/// Create a gateway in the process-wide default group.
pub fn make_gateway(spec: &str) -> anyhow::Result<Gateway> {
    DEFAULT_GROUP.make_gateway(spec)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_group_is_shared() {
        let a = default_group();
        let b = default_group();
        assert_eq!(a.len(), b.len());
    }
}
