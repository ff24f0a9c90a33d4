//! The operation registry: what a worker can be asked to run.
//!
//! A native runtime cannot compile source text, so CHANNEL_EXEC requests
//! address operations by name. Every worker carries the built-in set
//! (workspace setup, self-description, the socket-listener installer, a
//! byte echo); embedders register their own handlers next to them.

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use gatewire_proto::Value;
use itertools::Itertools;

use crate::channel::{Channel, ChannelError};
use crate::execmodel::spawn_named;
use crate::gateway::GatewayLink;
use crate::transport::Transport;

/// Everything a handler can reach while it runs: the bound channel, the
/// request's named arguments, and the worker it runs inside.
pub struct ExecContext {
    channel: Channel,
    kwargs: Vec<(String, Value)>,
    registry: Arc<OpRegistry>,
    link: Arc<GatewayLink>,
}

impl ExecContext {
    pub(crate) fn new(
        channel: Channel,
        kwargs: Vec<(String, Value)>,
        registry: Arc<OpRegistry>,
        link: Arc<GatewayLink>,
    ) -> ExecContext {
        ExecContext {
            channel,
            kwargs,
            registry,
            link,
        }
    }

    /// The channel bound to this execution. It closes automatically when
    /// the handler returns.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Look up a named argument.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// All named arguments, in wire order.
    pub fn kwargs(&self) -> &[(String, Value)] {
        &self.kwargs
    }

    /// Resolve a channel reference received inside a value.
    pub fn resolve_channel(&self, id: u32) -> Option<Channel> {
        self.link.factory.resolve(id)
    }

    pub(crate) fn registry(&self) -> Arc<OpRegistry> {
        self.registry.clone()
    }
}

type OpHandler = Arc<dyn Fn(&ExecContext) -> anyhow::Result<()> + Send + Sync>;

/// Named operations a worker resolves CHANNEL_EXEC requests against.
pub struct OpRegistry {
    ops: HashMap<String, OpHandler>,
}

impl OpRegistry {
    /// An empty registry.
    pub fn new() -> OpRegistry {
        OpRegistry {
            ops: HashMap::new(),
        }
    }

    /// A registry carrying the built-in operations every worker has.
    pub fn with_builtins() -> OpRegistry {
        let mut registry = OpRegistry::new();
        registry.register("setup", op_setup);
        registry.register("rinfo", op_rinfo);
        registry.register("init_threads", op_init_threads);
        registry.register("new_socket_listener", op_new_socket_listener);
        registry.register("echo", op_echo);
        registry
    }

    /// Register (or replace) an operation.
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&ExecContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ops.insert(name.to_owned(), Arc::new(handler));
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<OpHandler> {
        self.ops.get(name).cloned()
    }

    /// The registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.ops.keys().map(String::as_str).sorted().collect()
    }
}

impl Default for OpRegistry {
    fn default() -> OpRegistry {
        OpRegistry::with_builtins()
    }
}

/// Apply a spec's chdir/nice/env requests inside the worker.
fn op_setup(ctx: &ExecContext) -> anyhow::Result<()> {
    if let Some(dir) = ctx.kwarg("chdir").and_then(Value::as_text) {
        let path = Path::new(dir);
        if !path.exists() {
            std::fs::create_dir_all(path)
                .with_context(|| format!("cannot create workdir {:?}", dir))?;
        }
        std::env::set_current_dir(path)
            .with_context(|| format!("cannot change into {:?}", dir))?;
        debug!("changed workdir to {:?}", dir);
    }
    if let Some(increment) = ctx.kwarg("nice").and_then(Value::as_int) {
        let ret = unsafe { libc::nice(increment as libc::c_int) };
        if ret == -1 {
            warn!(
                "cannot renice worker by {}: {}",
                increment,
                io::Error::last_os_error()
            );
        }
    }
    if let Some(env) = ctx.kwarg("env").and_then(Value::as_dict) {
        for (key, value) in env {
            if let (Some(key), Some(value)) = (key.as_text(), value.as_text()) {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Send the worker's self-description.
fn op_rinfo(ctx: &ExecContext) -> anyhow::Result<()> {
    let executable = std::env::current_exe()
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cwd = std::env::current_dir()
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_default();
    let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_owned());
    ctx.channel().send(Value::Dict(vec![
        (Value::from("executable"), Value::from(executable)),
        (
            Value::from("platform"),
            Value::from(format!(
                "{}-{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            )),
        ),
        (Value::from("cwd"), Value::from(cwd)),
        (Value::from("pid"), Value::from(u64::from(std::process::id()))),
        (Value::from("version"), Value::from(env!("CARGO_PKG_VERSION"))),
        (
            Value::from("user"),
            Value::from(format!("{}@{}", whoami::username(), hostname)),
        ),
    ]))?;
    Ok(())
}

/// Acknowledge a worker-pool sizing request. Pooling is implicit here.
fn op_init_threads(ctx: &ExecContext) -> anyhow::Result<()> {
    let _requested = ctx.channel().receive(None)?;
    ctx.channel().send(Value::from("ok"))?;
    Ok(())
}

/// Bind a listener, report the bound address back, then serve one accepted
/// connection as a full worker session. This is the `installvia`
/// mechanism: the master learns the address from the channel and dials it.
fn op_new_socket_listener(ctx: &ExecContext) -> anyhow::Result<()> {
    let host = ctx
        .kwarg("host")
        .and_then(Value::as_text)
        .unwrap_or("127.0.0.1")
        .to_owned();
    let port = ctx.kwarg("port").and_then(Value::as_int).unwrap_or(0);
    let listener = TcpListener::bind((host.as_str(), port as u16))
        .with_context(|| format!("cannot bind socket listener on {}:{}", host, port))?;
    let addr = listener.local_addr()?;
    ctx.channel().send(Value::Tuple(vec![
        Value::from(addr.ip().to_string()),
        Value::from(u64::from(addr.port())),
    ]))?;
    let (stream, peer) = listener.accept().context("nobody dialed the listener")?;
    info!("socket gateway dialing in from {}", peer);
    let registry = ctx.registry();
    spawn_named(&format!("serve {}", peer), move || {
        match Transport::from_stream(stream) {
            Ok(transport) => {
                if let Err(err) = crate::serve::serve_transport(transport, registry) {
                    warn!("socket gateway session failed: {:#}", err);
                }
            }
            Err(err) => warn!("cannot wrap accepted connection: {}", err),
        }
    })?;
    Ok(())
}

/// Send every received item straight back, until the peer stops sending.
fn op_echo(ctx: &ExecContext) -> anyhow::Result<()> {
    loop {
        match ctx.channel().receive(None) {
            Ok(item) => ctx.channel().send(item)?,
            Err(ChannelError::Eof) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = OpRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec!["echo", "init_threads", "new_socket_listener", "rinfo", "setup"]
        );
        assert!(registry.resolve("rinfo").is_some());
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn register_replaces() {
        let mut registry = OpRegistry::new();
        registry.register("op", |_ctx: &ExecContext| Ok(()));
        registry.register("op", |_ctx: &ExecContext| anyhow::bail!("second"));
        assert_eq!(registry.names(), vec!["op"]);
    }
}
