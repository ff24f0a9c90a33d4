//! One endpoint of a bootstrapped connection.
//!
//! Both sides of the wire share the same core ([`GatewayLink`]): a
//! transport, a channel factory, and a single receiver task dispatching
//! frames under the receive lock. The master side wraps the core in
//! [`Gateway`] with the public `remote_*` surface; the worker side adds an
//! exec queue and lives in [`crate::serve`].

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use gatewire_proto::{dump, Frame, FrameError, LoadError, MsgCode, StrCoercion, Value};
use thiserror::Error;

use crate::channel::{Channel, ChannelError, ChannelFactory, Item, RemoteError};
use crate::execmodel::{ExecModel, Event, MAIN_THREAD_ONLY_DEADLOCK};
use crate::transport::{Transport, TransportError};
use crate::xspec::XSpec;

/// The ssh client could not reach the host (it exited with status 255
/// during bootstrap).
#[derive(Debug, Error)]
#[error("could not reach host {0}")]
pub struct HostNotFound(pub String);

/// What a CHANNEL_EXEC asks the peer to run.
///
/// The wire shape is `(source, callname, kwargs)`. `callname` addresses a
/// registered operation directly; bare `source` text is resolved as an
/// operation name by runtimes that cannot compile text. Keyword arguments
/// are only permitted together with a callname.
#[derive(Debug, Clone, Default)]
pub struct ExecCall {
    /// Free-form source text, resolved by the peer.
    pub source: Option<String>,
    /// Name of the operation to invoke.
    pub callname: Option<String>,
    /// Named arguments handed to the operation.
    pub kwargs: Vec<(String, Value)>,
}

impl ExecCall {
    /// A call addressing raw source text.
    pub fn source(text: impl Into<String>) -> ExecCall {
        ExecCall {
            source: Some(text.into()),
            ..ExecCall::default()
        }
    }

    /// A call addressing a registered operation by name.
    pub fn call(name: impl Into<String>) -> ExecCall {
        ExecCall {
            callname: Some(name.into()),
            ..ExecCall::default()
        }
    }

    /// Attach a named argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> ExecCall {
        self.kwargs.push((name.into(), value.into()));
        self
    }

    /// The operation the peer should resolve.
    pub(crate) fn target(&self) -> Option<&str> {
        self.callname
            .as_deref()
            .or(self.source.as_deref().map(str::trim))
    }

    pub(crate) fn to_value(&self) -> Value {
        let text_or_nil = |text: &Option<String>| match text {
            Some(text) => Value::Text(text.clone()),
            None => Value::Nil,
        };
        Value::Tuple(vec![
            text_or_nil(&self.source),
            text_or_nil(&self.callname),
            Value::Dict(
                self.kwargs
                    .iter()
                    .map(|(k, v)| (Value::Text(k.clone()), v.clone()))
                    .collect(),
            ),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> Option<ExecCall> {
        let items = value.as_seq()?;
        if items.len() != 3 {
            return None;
        }
        let text_or_nil = |value: &Value| match value {
            Value::Nil => Some(None),
            Value::Text(text) => Some(Some(text.clone())),
            _ => None,
        };
        let mut kwargs = Vec::new();
        for (key, val) in items[2].as_dict()? {
            kwargs.push((key.as_text()?.to_owned(), val.clone()));
        }
        Some(ExecCall {
            source: text_or_nil(&items[0])?,
            callname: text_or_nil(&items[1])?,
            kwargs,
        })
    }
}

impl From<&str> for ExecCall {
    fn from(text: &str) -> ExecCall {
        ExecCall::source(text)
    }
}

impl From<String> for ExecCall {
    fn from(text: String) -> ExecCall {
        ExecCall::source(text)
    }
}

/// Counters reported by the peer in reply to a STATUS message.
#[derive(Debug, Clone)]
pub struct RemoteStatus {
    /// The peer's receiver loop is alive.
    pub receiving: bool,
    /// Execution requests queued but not started.
    pub execqsize: usize,
    /// Channels the peer currently tracks.
    pub numchannels: usize,
    /// Executions currently running.
    pub numexecuting: usize,
}

impl RemoteStatus {
    fn from_value(value: &Value) -> Option<RemoteStatus> {
        let get_usize = |key: &str| {
            value
                .dict_get(key)
                .and_then(Value::as_int)
                .and_then(|i| usize::try_from(i).ok())
        };
        Some(RemoteStatus {
            receiving: value.dict_get("receiving")?.as_bool()?,
            execqsize: get_usize("execqsize")?,
            numchannels: get_usize("numchannels")?,
            numexecuting: get_usize("numexecuting")?,
        })
    }
}

/// The peer's self-description, fetched once and cached.
#[derive(Debug, Clone)]
pub struct RemoteInfo {
    /// Path of the worker executable.
    pub executable: String,
    /// Operating system and architecture.
    pub platform: String,
    /// The worker's working directory.
    pub cwd: String,
    /// The worker's process id.
    pub pid: i64,
    /// The worker's crate version.
    pub version: String,
    /// `user@host` of the worker.
    pub user: String,
}

impl RemoteInfo {
    fn from_value(value: &Value) -> Option<RemoteInfo> {
        let text = |key: &str| value.dict_get(key)?.as_text().map(str::to_owned);
        Some(RemoteInfo {
            executable: text("executable")?,
            platform: text("platform")?,
            cwd: text("cwd")?,
            pid: value.dict_get("pid")?.as_int()?,
            version: text("version")?,
            user: text("user")?,
        })
    }
}

/// Group-side hook a gateway notifies when it stops participating.
pub(crate) trait GroupHook: Send + Sync {
    /// The gateway `id` exited or lost its receiver.
    fn gateway_detached(&self, id: &str);
}

/// An execution request travelling from the receiver to the dispatch loop.
pub(crate) struct ExecTask {
    pub(crate) channel: Channel,
    pub(crate) call: ExecCall,
}

pub(crate) enum ExecItem {
    Task(ExecTask),
    Stop,
}

/// The worker side's execution state, attached to its [`GatewayLink`].
pub(crate) struct ExecHook {
    pub(crate) model: ExecModel,
    pub(crate) tx: crossbeam_channel::Sender<ExecItem>,
    /// Requests accepted but not yet finished (queued + running).
    pub(crate) pending: AtomicUsize,
    /// Requests currently running.
    pub(crate) executing: AtomicUsize,
}

impl ExecHook {
    pub(crate) fn new(model: ExecModel, tx: crossbeam_channel::Sender<ExecItem>) -> ExecHook {
        ExecHook {
            model,
            tx,
            pending: AtomicUsize::new(0),
            executing: AtomicUsize::new(0),
        }
    }
}

/// State shared by everything attached to one endpoint.
pub(crate) struct GatewayLink {
    pub(crate) id: String,
    pub(crate) transport: Transport,
    pub(crate) factory: ChannelFactory,
    receive_lock: Mutex<()>,
    coercion: Mutex<StrCoercion>,
    pub(crate) exec: Option<ExecHook>,
    pub(crate) receiver_done: Event,
    receiver_thread: Mutex<Option<JoinHandle<()>>>,
    group: Mutex<Option<Weak<dyn GroupHook>>>,
    remote_info_cache: Mutex<Option<RemoteInfo>>,
    /// The endpoint spec this side was created from; worker-side links
    /// have none.
    spec: Option<XSpec>,
    exited: AtomicBool,
}

impl GatewayLink {
    pub(crate) fn new(
        transport: Transport,
        id: String,
        startcount: u32,
        exec: Option<ExecHook>,
        spec: Option<XSpec>,
    ) -> GatewayLink {
        GatewayLink {
            id,
            transport,
            factory: ChannelFactory::new(startcount),
            receive_lock: Mutex::new(()),
            coercion: Mutex::new(StrCoercion::default()),
            exec,
            receiver_done: Event::new(),
            receiver_thread: Mutex::new(None),
            group: Mutex::new(None),
            remote_info_cache: Mutex::new(None),
            spec,
            exited: AtomicBool::new(false),
        }
    }

    pub(crate) fn start_receiver(self: &Arc<GatewayLink>) -> io::Result<()> {
        let link = self.clone();
        let handle = crate::execmodel::spawn_named(&format!("{} receiver", self.id), move || {
            receiver_loop(link)
        })?;
        *self
            .receiver_thread
            .lock()
            .expect("Cannot lock receiver handle") = Some(handle);
        Ok(())
    }

    pub(crate) fn take_receiver(&self) -> Option<JoinHandle<()>> {
        self.receiver_thread
            .lock()
            .expect("Cannot lock receiver handle")
            .take()
    }

    pub(crate) fn lock_receive(&self) -> std::sync::MutexGuard<'_, ()> {
        self.receive_lock.lock().expect("Cannot lock receive lock")
    }

    /// Serialise a frame onto the wire. The transport's writer mutex makes
    /// the write atomic with respect to other senders.
    pub(crate) fn send_frame(&self, frame: Frame) -> io::Result<()> {
        trace!("[{}] sent -> {:?}", self.id, frame);
        let bytes = frame
            .to_bytes()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.transport.write_all(&bytes).map_err(|err| match err {
            TransportError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::BrokenPipe, other.to_string()),
        })
    }

    /// Decode a frame payload, pre-registering proxies for every channel
    /// reference it carries.
    fn load_payload(self: &Arc<GatewayLink>, frame: &Frame) -> Result<Value, LoadError> {
        let coercion = *self.coercion.lock().expect("Cannot lock coercion");
        gatewire_proto::load_with(&frame.payload, coercion, |channel_id| {
            self.factory.ensure_remote_state(self, channel_id);
        })
    }

    pub(crate) fn set_coercion(&self, coercion: StrCoercion) {
        *self.coercion.lock().expect("Cannot lock coercion") = coercion;
    }

    pub(crate) fn set_group(&self, hook: Weak<dyn GroupHook>) {
        *self.group.lock().expect("Cannot lock group hook") = Some(hook);
    }

    fn detach_from_group(&self) {
        let hook = self
            .group
            .lock()
            .expect("Cannot lock group hook")
            .clone();
        if let Some(hook) = hook.and_then(|weak| weak.upgrade()) {
            hook.gateway_detached(&self.id);
        }
    }

    pub(crate) fn mark_exited(&self) -> bool {
        self.exited.swap(true, Ordering::SeqCst)
    }
}

enum Dispatch {
    Continue,
    Stop,
}

/// The per-gateway receiver task: read frames, dispatch them under the
/// receive lock, and on any exit clean the endpoint up in order.
pub(crate) fn receiver_loop(link: Arc<GatewayLink>) {
    trace!("[{}] starting to receive", link.id);
    defer! {
        if let Some(exec) = &link.exec {
            let _ = exec.tx.send(ExecItem::Stop);
        }
        link.transport.close_write();
        link.factory.finished_receiving();
        link.detach_from_group();
        link.receiver_done.set();
        trace!("[{}] receiver finished", link.id);
    }
    loop {
        let frame = match link.transport.read_frame() {
            Ok(frame) => frame,
            Err(FrameError::Eof) => {
                trace!("[{}] peer closed the stream", link.id);
                break;
            }
            Err(err) => {
                warn!("[{}] receive failed: {}", link.id, err);
                break;
            }
        };
        trace!("[{}] received <- {:?}", link.id, frame);
        let outcome = {
            let _guard = link.lock_receive();
            dispatch_frame(&link, frame)
        };
        match outcome {
            Ok(Dispatch::Continue) => {}
            Ok(Dispatch::Stop) => break,
            Err(err) => {
                warn!("[{}] wire corruption, terminating session: {}", link.id, err);
                break;
            }
        }
    }
}

fn dispatch_frame(link: &Arc<GatewayLink>, frame: Frame) -> Result<Dispatch, LoadError> {
    match frame.code {
        MsgCode::ChannelData => {
            let value = link.load_payload(&frame)?;
            link.factory.local_receive(frame.channel_id, Item::Value(value));
        }
        MsgCode::ChannelNew => {
            let value = link.load_payload(&frame)?;
            let new_id = value
                .as_int()
                .and_then(|i| u32::try_from(i).ok())
                .ok_or(LoadError::Malformed("CHANNEL_NEW payload is not a channel id"))?;
            let channel = link.factory.ensure_remote(link, new_id);
            link.factory
                .local_receive(frame.channel_id, Item::Channel(channel));
        }
        MsgCode::ChannelClose => link.factory.local_close(frame.channel_id, None, false),
        MsgCode::ChannelCloseError => {
            let value = link.load_payload(&frame)?;
            let text = match value {
                Value::Text(text) => text,
                Value::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                other => format!("{:?}", other),
            };
            link.factory
                .local_close(frame.channel_id, Some(RemoteError(text)), false);
        }
        MsgCode::ChannelLastMessage => link.factory.local_close(frame.channel_id, None, true),
        MsgCode::Status => {
            let (execqsize, numexecuting) = match &link.exec {
                Some(exec) => (exec.tx.len(), exec.executing.load(Ordering::SeqCst)),
                None => (0, 0),
            };
            let status = Value::Dict(vec![
                (Value::from("receiving"), Value::Bool(true)),
                (Value::from("execqsize"), Value::from(execqsize)),
                (
                    Value::from("numchannels"),
                    Value::from(link.factory.channel_count()),
                ),
                (Value::from("numexecuting"), Value::from(numexecuting)),
            ]);
            let payload = dump(&status).expect("status counters are always serialisable");
            if let Err(err) =
                link.send_frame(Frame::new(MsgCode::ChannelData, frame.channel_id, payload))
            {
                trace!("[{}] could not answer STATUS: {}", link.id, err);
            }
        }
        MsgCode::Reconfigure => {
            let value = link.load_payload(&frame)?;
            let flags = value
                .as_seq()
                .ok_or(LoadError::Malformed("RECONFIGURE payload is not a tuple"))?;
            link.set_coercion(StrCoercion {
                bytetext_as_text: flags.first().and_then(Value::as_bool).unwrap_or(false),
                text_as_bytes: flags.get(1).and_then(Value::as_bool).unwrap_or(false),
            });
        }
        MsgCode::GatewayTerminate => {
            trace!("[{}] peer requested termination", link.id);
            return Ok(Dispatch::Stop);
        }
        MsgCode::ChannelExec => {
            let Some(exec) = &link.exec else {
                let payload = dump(&Value::Text(
                    "this side does not execute remote calls".to_owned(),
                ))
                .expect("text is always serialisable");
                let _ = link.send_frame(Frame::new(
                    MsgCode::ChannelCloseError,
                    frame.channel_id,
                    payload,
                ));
                return Ok(Dispatch::Continue);
            };
            let value = link.load_payload(&frame)?;
            let call = ExecCall::from_value(&value)
                .ok_or(LoadError::Malformed("CHANNEL_EXEC payload is not a call"))?;
            let channel = link.factory.ensure_remote(link, frame.channel_id);
            if exec.model == ExecModel::MainThreadOnly
                && exec.pending.load(Ordering::SeqCst) > 0
            {
                warn!(
                    "[{}] refusing concurrent execution on channel {}",
                    link.id, frame.channel_id
                );
                let _ = channel.close(Some(MAIN_THREAD_ONLY_DEADLOCK));
                return Ok(Dispatch::Continue);
            }
            exec.pending.fetch_add(1, Ordering::SeqCst);
            if exec
                .tx
                .send(ExecItem::Task(ExecTask { channel: channel.clone(), call }))
                .is_err()
            {
                exec.pending.fetch_sub(1, Ordering::SeqCst);
                let _ = channel.close(Some("the execution dispatcher is gone"));
            }
        }
    }
    Ok(Dispatch::Continue)
}

/// The master's handle on one bootstrapped endpoint.
///
/// Cloning is cheap; clones address the same gateway.
#[derive(Clone)]
pub struct Gateway {
    pub(crate) link: Arc<GatewayLink>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_receiving() {
            "receive-live"
        } else {
            "not-receiving"
        };
        write!(
            f,
            "<Gateway id={:?} {}, {} active channels>",
            self.id(),
            state,
            self.link.factory.channel_count()
        )
    }
}

impl Gateway {
    /// Drive the bootstrap handshake over an open transport and start the
    /// receiver.
    ///
    /// The master ships one length-prefixed configuration payload, the
    /// worker answers the readiness byte `b"1"` and enters its serve loop.
    /// EOF before the acknowledgement is a bootstrap failure; if the
    /// transport's child is an ssh client that exited with 255, it becomes
    /// [`HostNotFound`].
    pub(crate) fn bootstrap(
        transport: Transport,
        id: &str,
        spec: &XSpec,
        remote_addr: Option<&str>,
    ) -> anyhow::Result<Gateway> {
        let execmodel = spec.execmodel.as_deref().unwrap_or("threaded");
        ExecModel::from_name(execmodel)?;
        let config = Value::Dict(vec![
            (Value::from("id"), Value::from(format!("{}-remote", id))),
            (Value::from("execmodel"), Value::from(execmodel)),
        ]);
        let blob = dump(&config).context("cannot encode the bootstrap payload")?;
        let mut payload = Vec::with_capacity(4 + blob.len());
        payload.extend_from_slice(&(blob.len() as u32).to_be_bytes());
        payload.extend_from_slice(&blob);
        transport
            .write_all(&payload)
            .context("cannot send the bootstrap payload")?;

        let mut ack = [0u8; 1];
        match transport.read_exact(&mut ack) {
            Ok(()) if ack[0] == b'1' => {}
            Ok(()) => bail!(
                "unexpected bootstrap acknowledgement {:#04x} from {}",
                ack[0],
                transport.describe()
            ),
            Err(err) => {
                if let Ok(Some(status)) = transport.wait() {
                    if status.code() == Some(255) {
                        if let Some(addr) = remote_addr {
                            return Err(HostNotFound(addr.to_owned()).into());
                        }
                    }
                }
                return Err(anyhow::Error::new(err).context("endpoint did not come up"));
            }
        }
        debug!("gateway {} is up on {}", id, transport.describe());
        let link = Arc::new(GatewayLink::new(
            transport,
            id.to_owned(),
            1,
            None,
            Some(spec.clone()),
        ));
        link.start_receiver()
            .context("cannot spawn the receiver task")?;
        Ok(Gateway { link })
    }

    /// This gateway's id within its group.
    pub fn id(&self) -> &str {
        &self.link.id
    }

    /// The endpoint spec this gateway was created from.
    pub fn spec(&self) -> &XSpec {
        self.link
            .spec
            .as_ref()
            .expect("master gateways always carry their spec")
    }

    /// Whether the receiver task is still alive.
    pub fn is_receiving(&self) -> bool {
        !self.link.receiver_done.is_set()
    }

    /// Open a fresh channel, registered locally and introduced to the peer
    /// on first use.
    pub fn new_channel(&self) -> Result<Channel, ChannelError> {
        self.link.factory.new_local(&self.link)
    }

    /// Resolve a channel reference received inside a value.
    pub fn resolve_channel(&self, id: u32) -> Option<Channel> {
        self.link.factory.resolve(id)
    }

    /// Ask the peer to run an operation, with a channel bound to it.
    ///
    /// Returns immediately; results, errors and the implicit close arrive
    /// on the returned channel.
    pub fn remote_exec(&self, call: impl Into<ExecCall>) -> anyhow::Result<Channel> {
        let call = call.into();
        if call.callname.is_none() && !call.kwargs.is_empty() {
            bail!("keyword arguments require a named callable");
        }
        if call.target().is_none() {
            bail!("nothing to execute: no source and no callname");
        }
        let channel = self.new_channel()?;
        let payload = dump(&call.to_value())?;
        self.link
            .send_frame(Frame::new(MsgCode::ChannelExec, channel.id(), payload))?;
        Ok(channel)
    }

    /// Fetch the peer's execution counters.
    ///
    /// The reply channel is synthesised locally; the peer never
    /// materialises it.
    pub fn remote_status(&self, timeout: Option<Duration>) -> anyhow::Result<RemoteStatus> {
        let channel = self.new_channel()?;
        self.link
            .send_frame(Frame::empty(MsgCode::Status, channel.id()))?;
        let item = channel.receive(timeout).context("no STATUS reply")?;
        self.link.factory.local_close(channel.id(), None, false);
        let value = item
            .into_value()
            .ok_or_else(|| anyhow!("STATUS reply is not a value"))?;
        RemoteStatus::from_value(&value).ok_or_else(|| anyhow!("malformed STATUS reply"))
    }

    /// The peer's self-description, fetched once and cached.
    pub fn remote_info(&self) -> anyhow::Result<RemoteInfo> {
        if let Some(info) = self
            .link
            .remote_info_cache
            .lock()
            .expect("Cannot lock remote info")
            .clone()
        {
            return Ok(info);
        }
        self.remote_info_refresh()
    }

    /// Re-fetch the peer's self-description.
    pub fn remote_info_refresh(&self) -> anyhow::Result<RemoteInfo> {
        let channel = self.remote_exec(ExecCall::call("rinfo"))?;
        let value = channel
            .receive(None)?
            .into_value()
            .ok_or_else(|| anyhow!("rinfo reply is not a value"))?;
        channel.wait_close(None)?;
        let info =
            RemoteInfo::from_value(&value).ok_or_else(|| anyhow!("malformed rinfo reply"))?;
        *self
            .link
            .remote_info_cache
            .lock()
            .expect("Cannot lock remote info") = Some(info.clone());
        Ok(info)
    }

    /// Install a worker pool of `num` threads on the peer.
    ///
    /// The native worker pools implicitly, so this is an acknowledged
    /// no-op kept for callers that expect to size the pool.
    pub fn remote_init_threads(&self, num: Option<usize>) -> anyhow::Result<()> {
        let channel = self.remote_exec(ExecCall::call("init_threads"))?;
        channel.send(match num {
            Some(num) => Value::from(num),
            None => Value::Nil,
        })?;
        let reply = channel.receive(None)?.into_value();
        anyhow::ensure!(
            reply.as_ref().and_then(|v| v.as_text()) == Some("ok"),
            "worker-pool installation failed: {:?}",
            reply
        );
        Ok(())
    }

    /// Set the string-coercion policy on both decoders of this gateway
    /// pair.
    pub fn reconfigure(&self, bytetext_as_text: bool, text_as_bytes: bool) -> anyhow::Result<()> {
        self.link.set_coercion(StrCoercion {
            bytetext_as_text,
            text_as_bytes,
        });
        let payload = dump(&Value::Tuple(vec![
            Value::Bool(bytetext_as_text),
            Value::Bool(text_as_bytes),
        ]))?;
        self.link
            .send_frame(Frame::new(MsgCode::Reconfigure, 0, payload))?;
        Ok(())
    }

    /// Trigger gateway exit: send GATEWAY_TERMINATE and half-close the
    /// write side. Joining the receiver and reaping the endpoint are
    /// deferred to the group's terminate.
    pub fn exit(&self) {
        if self.link.mark_exited() {
            trace!("[{}] exit already requested", self.id());
            return;
        }
        trace!("[{}] exit requested", self.id());
        self.link.detach_from_group();
        if let Err(err) = self
            .link
            .send_frame(Frame::empty(MsgCode::GatewayTerminate, 0))
        {
            trace!("[{}] could not send termination: {}", self.id(), err);
        }
        self.link.transport.close_write();
    }

    /// Wait for the receiver task to finish. Returns `false` on timeout.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        if !self.link.receiver_done.wait(timeout) {
            return false;
        }
        if let Some(handle) = self.link.take_receiver() {
            let _ = handle.join();
        }
        true
    }

    pub(crate) fn reap_endpoint(&self) {
        if let Err(err) = self.link.transport.wait() {
            trace!("[{}] endpoint wait failed: {}", self.id(), err);
        }
    }

    pub(crate) fn kill_endpoint(&self) {
        self.link.transport.kill();
    }
}

/// Build the argv of a local pipe worker: the configured runtime (or this
/// very executable) in stdio serve mode.
pub(crate) fn popen_args(spec: &XSpec) -> anyhow::Result<Vec<String>> {
    let mut argv = match &spec.runtime {
        Some(runtime) => runtime_argv(runtime)?,
        None => vec![std::env::current_exe()
            .context("cannot locate this executable")?
            .to_string_lossy()
            .into_owned()],
    };
    argv.push("serve-stdio".to_owned());
    Ok(argv)
}

fn runtime_argv(runtime: &str) -> anyhow::Result<Vec<String>> {
    let mut argv = shell_words::split(runtime).context("cannot parse the runtime command")?;
    match argv.first_mut() {
        None => bail!("empty runtime command"),
        Some(program) if !program.contains('/') => {
            *program = which::which(program.as_str())
                .with_context(|| format!("runtime {:?} not found in PATH", program))?
                .to_string_lossy()
                .into_owned();
        }
        Some(_) => {}
    }
    Ok(argv)
}

fn remote_command(spec: &XSpec) -> String {
    let runtime = spec.runtime.as_deref().unwrap_or("gatewire-worker");
    format!("{} serve-stdio", runtime)
}

/// Build the argv of an ssh worker; the destination may carry extra ssh
/// options.
pub(crate) fn ssh_args(spec: &XSpec, destination: &str) -> anyhow::Result<Vec<String>> {
    let mut argv = vec!["ssh".to_owned(), "-C".to_owned()];
    if let Some(config) = &spec.ssh_config {
        argv.push("-F".to_owned());
        argv.push(config.clone());
    }
    argv.extend(shell_words::split(destination).context("cannot parse the ssh destination")?);
    argv.push(remote_command(spec));
    Ok(argv)
}

/// Build the argv of a worker reached through `vagrant ssh`.
pub(crate) fn vagrant_args(spec: &XSpec, machine: &str) -> Vec<String> {
    vec![
        "vagrant".to_owned(),
        "ssh".to_owned(),
        machine.to_owned(),
        "--".to_owned(),
        remote_command(spec),
    ]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn exec_call_roundtrips_through_the_wire_shape() {
        let call = ExecCall::call("compress")
            .kwarg("level", 9i64)
            .kwarg("label", "fast");
        let back = ExecCall::from_value(&call.to_value()).unwrap();
        assert_eq!(back.callname.as_deref(), Some("compress"));
        assert_eq!(back.source, None);
        assert_eq!(
            back.kwargs,
            vec![
                ("level".to_owned(), Value::Int(9)),
                ("label".to_owned(), Value::from("fast")),
            ]
        );

        let call = ExecCall::source("  echo  ");
        let back = ExecCall::from_value(&call.to_value()).unwrap();
        assert_eq!(back.target(), Some("echo"));
    }

    #[test]
    fn malformed_exec_payloads_are_rejected() {
        assert!(ExecCall::from_value(&Value::Int(3)).is_none());
        assert!(ExecCall::from_value(&Value::Tuple(vec![Value::Nil, Value::Nil])).is_none());
        assert!(ExecCall::from_value(&Value::Tuple(vec![
            Value::Int(1),
            Value::Nil,
            Value::Dict(vec![])
        ]))
        .is_none());
    }

    #[test]
    fn ssh_args_carry_config_and_options() {
        let spec: XSpec = "ssh=-p 2222 user@host//ssh_config=/tmp/cfg".parse().unwrap();
        let argv = ssh_args(&spec, spec.ssh.as_deref().unwrap()).unwrap();
        assert_eq!(
            argv,
            vec![
                "ssh",
                "-C",
                "-F",
                "/tmp/cfg",
                "-p",
                "2222",
                "user@host",
                "gatewire-worker serve-stdio",
            ]
        );
    }

    #[test]
    fn ssh_args_use_the_configured_runtime() {
        let spec: XSpec = "ssh=host//runtime=/opt/bin/worker".parse().unwrap();
        let argv = ssh_args(&spec, "host").unwrap();
        assert_eq!(
            argv.last().map(String::as_str),
            Some("/opt/bin/worker serve-stdio")
        );
    }

    #[test]
    fn vagrant_args_wrap_the_remote_command() {
        let spec: XSpec = "vagrant_ssh=default".parse().unwrap();
        assert_eq!(
            vagrant_args(&spec, "default"),
            vec!["vagrant", "ssh", "default", "--", "gatewire-worker serve-stdio"]
        );
    }

    #[test]
    fn popen_args_use_an_explicit_runtime_verbatim() {
        let spec: XSpec = "popen//runtime=/usr/local/bin/worker --quiet".parse().unwrap();
        let argv = popen_args(&spec).unwrap();
        assert_eq!(
            argv,
            vec!["/usr/local/bin/worker", "--quiet", "serve-stdio"]
        );
    }
}
