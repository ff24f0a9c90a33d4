//! The worker side of a gateway: bootstrap intake, exec dispatch, serve
//! loops.
//!
//! A worker session starts from a raw transport: it reads the master's
//! length-prefixed bootstrap payload, acknowledges with the readiness byte,
//! then runs a receiver task plus a dispatch loop draining the exec queue.
//! Under the threaded model each request runs on its own named thread;
//! under main-thread-only, requests run one at a time on the serving
//! thread itself.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use gatewire_proto::{load, Value};

use crate::execmodel::{spawn_named, ExecModel};
use crate::gateway::{ExecHook, ExecItem, ExecTask, GatewayLink};
use crate::ops::{ExecContext, OpRegistry};
use crate::transport::Transport;

/// Session settings used when the master's bootstrap payload does not name
/// them, typically from the worker binary's command line. The payload wins.
#[derive(Debug, Clone, Default)]
pub struct ServeDefaults {
    /// Fallback gateway id.
    pub id: Option<String>,
    /// Fallback execution model.
    pub execmodel: Option<ExecModel>,
}

struct BootConfig {
    id: String,
    execmodel: ExecModel,
}

fn read_bootstrap(transport: &Transport, defaults: &ServeDefaults) -> anyhow::Result<BootConfig> {
    let mut len = [0u8; 4];
    transport
        .read_exact(&mut len)
        .context("no bootstrap payload arrived")?;
    let len = u32::from_be_bytes(len) as usize;
    anyhow::ensure!(
        len <= 1 << 20,
        "bootstrap payload of {} bytes is implausible",
        len
    );
    let mut blob = vec![0u8; len];
    transport
        .read_exact(&mut blob)
        .context("bootstrap payload was cut short")?;
    let config = load(&blob).context("malformed bootstrap payload")?;
    let id = config
        .dict_get("id")
        .and_then(Value::as_text)
        .map(str::to_owned)
        .or_else(|| defaults.id.clone())
        .unwrap_or_else(|| "remote".to_owned());
    let execmodel = match config.dict_get("execmodel").and_then(Value::as_text) {
        Some(name) => ExecModel::from_name(name)?,
        None => defaults.execmodel.unwrap_or_default(),
    };
    Ok(BootConfig { id, execmodel })
}

/// Serve one gateway session over an open transport until the master
/// terminates it or the stream dies.
pub fn serve_transport(transport: Transport, registry: Arc<OpRegistry>) -> anyhow::Result<()> {
    serve_session(transport, registry, &ServeDefaults::default())
}

fn serve_session(
    transport: Transport,
    registry: Arc<OpRegistry>,
    defaults: &ServeDefaults,
) -> anyhow::Result<()> {
    crate::trace::init_from_env();
    let boot = read_bootstrap(&transport, defaults)?;
    transport
        .write_all(b"1")
        .context("cannot acknowledge the bootstrap")?;
    info!("serving gateway {} ({} model)", boot.id, boot.execmodel.name());

    let (tx, rx) = crossbeam_channel::unbounded();
    let link = Arc::new(GatewayLink::new(
        transport,
        boot.id,
        2,
        Some(ExecHook::new(boot.execmodel, tx)),
        None,
    ));
    link.start_receiver()
        .context("cannot spawn the receiver task")?;

    while let Ok(item) = rx.recv() {
        match item {
            ExecItem::Stop => break,
            ExecItem::Task(task) => match boot.execmodel {
                ExecModel::MainThreadOnly => run_task(&link, &registry, task),
                ExecModel::Threaded => {
                    let channel = task.channel.clone();
                    let task_link = link.clone();
                    let task_registry = registry.clone();
                    let name = format!("execute channel {}", channel.id());
                    let spawned = spawn_named(&name, move || {
                        run_task(&task_link, &task_registry, task)
                    });
                    if let Err(err) = spawned {
                        let exec = link.exec.as_ref().expect("worker link has an exec hook");
                        exec.pending.fetch_sub(1, Ordering::SeqCst);
                        let _ = channel.close(Some(&format!(
                            "cannot start an execution thread: {}",
                            err
                        )));
                    }
                }
            },
        }
    }

    if let Some(handle) = link.take_receiver() {
        let _ = handle.join();
    }
    info!("gateway {} finished serving", link.id);
    Ok(())
}

/// Run one execution request to completion and close its channel: plain
/// close on success, close-with-error carrying the formatted error chain
/// on failure.
fn run_task(link: &Arc<GatewayLink>, registry: &Arc<OpRegistry>, task: ExecTask) {
    let ExecTask { channel, call } = task;
    let exec = link.exec.as_ref().expect("worker link has an exec hook");
    let target = call.target().map(str::to_owned);
    trace!(
        "[{}] execution starts on channel {}: {:?}",
        link.id,
        channel.id(),
        target
    );
    exec.executing.fetch_add(1, Ordering::SeqCst);
    channel.set_executing(true);
    let result = match target.as_deref() {
        None => Err(anyhow!("nothing to execute")),
        Some(name) => match registry.resolve(name) {
            None => Err(anyhow!("no operation {:?} is registered on this worker", name)),
            Some(handler) => {
                let ctx = ExecContext::new(
                    channel.clone(),
                    call.kwargs,
                    registry.clone(),
                    link.clone(),
                );
                handler(&ctx)
            }
        },
    };
    channel.set_executing(false);
    exec.executing.fetch_sub(1, Ordering::SeqCst);
    exec.pending.fetch_sub(1, Ordering::SeqCst);
    match result {
        Ok(()) => {
            trace!("[{}] execution finished on channel {}", link.id, channel.id());
            if let Err(err) = channel.close(None) {
                trace!("[{}] implicit close failed: {}", link.id, err);
            }
        }
        Err(error) => {
            let text = format!(
                "remote execution of {:?} failed:\n{:?}",
                target.as_deref().unwrap_or("<unnamed>"),
                error
            );
            debug!("[{}] {}", link.id, text);
            if let Err(err) = channel.close(Some(&text)) {
                trace!("[{}] error close failed: {}", link.id, err);
            }
        }
    }
}

/// Serve one session over an accepted TCP connection.
pub fn serve_connection(stream: TcpStream, registry: Arc<OpRegistry>) -> anyhow::Result<()> {
    serve_transport(Transport::from_stream(stream)?, registry)
}

/// Serve one session over this process' stdin/stdout. The remote end of
/// pipe and ssh gateways.
pub fn serve_stdio(registry: Arc<OpRegistry>) -> anyhow::Result<()> {
    serve_stdio_with(registry, &ServeDefaults::default())
}

/// Like [`serve_stdio`], with fallback session settings for masters whose
/// bootstrap payload does not name them.
pub fn serve_stdio_with(
    registry: Arc<OpRegistry>,
    defaults: &ServeDefaults,
) -> anyhow::Result<()> {
    serve_session(Transport::stdio()?, registry, defaults)
}

/// Accept socket gateway connections and serve each in its own thread.
/// With `once`, stop accepting after the first connection.
pub fn listen(bind: &str, once: bool, registry: Arc<OpRegistry>) -> anyhow::Result<()> {
    let listener =
        TcpListener::bind(bind).with_context(|| format!("cannot bind on {:?}", bind))?;
    info!(
        "accepting gateway connections on {}",
        listener.local_addr()?
    );
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "unknown".to_owned());
                info!("gateway connection from {}", peer);
                let registry = registry.clone();
                let handle = spawn_named(&format!("serve {}", peer), move || {
                    if let Err(err) = serve_connection(stream, registry) {
                        warn!("session from {} failed: {:#}", peer, err);
                    }
                })?;
                if once {
                    let _ = handle.join();
                    break;
                }
            }
            Err(err) => warn!("accept failed: {}", err),
        }
    }
    Ok(())
}
