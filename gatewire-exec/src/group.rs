//! Many-gateway lifecycle: creation from specs, ordered termination,
//! fan-out.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use itertools::Itertools;

use crate::channel::{Channel, ChannelError, Item};
use crate::execmodel::{spawn_named, Event, ExecModel};
use crate::gateway::{
    popen_args, ssh_args, vagrant_args, ExecCall, Gateway, GroupHook,
};
use crate::transport::Transport;
use crate::xspec::XSpec;
use gatewire_proto::Value;

/// An insertion-ordered collection of gateways with shared lifecycle.
///
/// Cloning is cheap; clones share the same membership. Dropping the last
/// handle asks surviving members to exit (best-effort, without joining).
#[derive(Clone, Default)]
pub struct Group {
    inner: Arc<GroupInner>,
}

#[derive(Default)]
pub(crate) struct GroupInner {
    state: Mutex<GroupState>,
}

struct GroupState {
    active: Vec<Gateway>,
    to_join: Vec<Gateway>,
    autoid: u32,
    local_model: ExecModel,
    default_remote_model: Option<String>,
}

impl Default for GroupState {
    fn default() -> GroupState {
        GroupState {
            active: Vec::new(),
            to_join: Vec::new(),
            autoid: 0,
            local_model: ExecModel::default(),
            default_remote_model: None,
        }
    }
}

impl GroupInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, GroupState> {
        self.state.lock().expect("Cannot lock group state")
    }
}

impl GroupHook for GroupInner {
    fn gateway_detached(&self, id: &str) {
        let mut state = self.lock();
        if let Some(pos) = state.active.iter().position(|gw| gw.id() == id) {
            let gateway = state.active.remove(pos);
            state.to_join.push(gateway);
        }
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().expect("Cannot lock group state");
        for gateway in state.active.drain(..) {
            gateway.exit();
        }
    }
}

impl Group {
    /// An empty group with the default (threaded) execution model.
    pub fn new() -> Group {
        Group::default()
    }

    /// Choose the execution models: `local` for this side's plumbing,
    /// `remote` as the default for specs that do not name one. Only legal
    /// while the group has no members.
    pub fn set_execmodel(&self, local: &str, remote: Option<&str>) -> anyhow::Result<()> {
        let local = ExecModel::from_name(local)?;
        if let Some(remote) = remote {
            ExecModel::from_name(remote)?;
        }
        let mut state = self.inner.lock();
        if !state.active.is_empty() || !state.to_join.is_empty() {
            bail!("the execution model is fixed once the group has members");
        }
        state.local_model = local;
        state.default_remote_model = remote.map(str::to_owned);
        Ok(())
    }

    /// The local execution model.
    pub fn execmodel(&self) -> ExecModel {
        self.inner.lock().local_model
    }

    /// Create, bootstrap and register a gateway from an endpoint spec.
    ///
    /// Picks the transport from the spec (`popen`, `ssh=`, `vagrant_ssh=`,
    /// `socket=`, optionally `installvia=`), allocates the id (`gw<n>`
    /// unless the spec names one), runs the bootstrap handshake, and
    /// applies `chdir`/`nice`/`env:` entries on the new worker before
    /// returning.
    pub fn make_gateway(&self, spec: &str) -> anyhow::Result<Gateway> {
        crate::trace::init_from_env();
        let mut spec: XSpec = spec.parse()?;
        let id = {
            let mut state = self.inner.lock();
            match &spec.id {
                Some(id) => {
                    if state
                        .active
                        .iter()
                        .chain(state.to_join.iter())
                        .any(|gw| gw.id() == id)
                    {
                        bail!("duplicate gateway id {:?}", id);
                    }
                    id.clone()
                }
                None => {
                    let id = format!("gw{}", state.autoid);
                    state.autoid += 1;
                    id
                }
            }
        };
        if spec.execmodel.is_none() {
            spec.execmodel = self.inner.lock().default_remote_model.clone();
        }

        let gateway = if spec.popen {
            let argv = popen_args(&spec)?;
            let transport = Transport::spawn(&argv)
                .with_context(|| format!("cannot spawn worker {:?}", argv[0]))?;
            Gateway::bootstrap(transport, &id, &spec, None)?
        } else if let Some(destination) = spec.ssh.clone() {
            let argv = ssh_args(&spec, &destination)?;
            let transport = Transport::spawn(&argv).context("cannot spawn the ssh client")?;
            Gateway::bootstrap(transport, &id, &spec, Some(&destination))?
        } else if let Some(machine) = spec.vagrant_ssh.clone() {
            let argv = vagrant_args(&spec, &machine);
            let transport = Transport::spawn(&argv).context("cannot spawn vagrant ssh")?;
            Gateway::bootstrap(transport, &id, &spec, Some(&machine))?
        } else if let Some(addr) = spec.socket.clone() {
            if let Some(via) = spec.installvia.clone() {
                self.socket_via(&via, &addr, &id, &spec)?
            } else {
                let transport = Transport::connect(&addr)
                    .with_context(|| format!("cannot connect to {:?}", addr))?;
                Gateway::bootstrap(transport, &id, &spec, None)?
            }
        } else {
            bail!("no transport in spec {:?}", spec.as_str());
        };

        {
            let mut state = self.inner.lock();
            let dyn_inner: Arc<dyn GroupHook> = self.inner.clone();
            let hook: Weak<dyn GroupHook> = Arc::downgrade(&dyn_inner);
            gateway.link.set_group(hook);
            state.active.push(gateway.clone());
        }

        if spec.needs_setup() {
            let mut call = ExecCall::call("setup");
            if let Some(chdir) = &spec.chdir {
                call = call.kwarg("chdir", chdir.as_str());
            }
            if let Some(nice) = spec.nice {
                call = call.kwarg("nice", i64::from(nice));
            }
            if !spec.env.is_empty() {
                call = call.kwarg(
                    "env",
                    Value::Dict(
                        spec.env
                            .iter()
                            .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
                            .collect(),
                    ),
                );
            }
            let channel = gateway
                .remote_exec(call)
                .context("cannot apply the workspace setup")?;
            channel
                .wait_close(None)
                .context("workspace setup failed on the worker")?;
        }
        Ok(gateway)
    }

    /// Install a socket listener through an existing gateway and dial it.
    /// The spec's `socket=host:port` is the listener's bind request.
    fn socket_via(
        &self,
        via: &str,
        addr: &str,
        id: &str,
        spec: &XSpec,
    ) -> anyhow::Result<Gateway> {
        let viagw = self
            .get(via)
            .ok_or_else(|| anyhow!("no gateway {:?} to install via", via))?;
        let (bind_host, bind_port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("socket spec {:?} is not host:port", addr))?;
        let bind_port: u16 = bind_port
            .parse()
            .with_context(|| format!("bad port in socket spec {:?}", addr))?;
        let channel = viagw.remote_exec(
            ExecCall::call("new_socket_listener")
                .kwarg("host", bind_host)
                .kwarg("port", i64::from(bind_port)),
        )?;
        let reply = channel
            .receive(None)
            .context("the listener never reported its address")?
            .into_value()
            .ok_or_else(|| anyhow!("unexpected listener reply"))?;
        let parts = reply
            .as_seq()
            .ok_or_else(|| anyhow!("unexpected listener reply"))?;
        let mut host = parts
            .first()
            .and_then(Value::as_text)
            .ok_or_else(|| anyhow!("listener reply without a host"))?
            .to_owned();
        let port = parts
            .get(1)
            .and_then(Value::as_int)
            .ok_or_else(|| anyhow!("listener reply without a port"))?;
        if host.is_empty() || host == "0.0.0.0" {
            host = "127.0.0.1".to_owned();
        }
        let transport = Transport::connect(&format!("{}:{}", host, port))
            .with_context(|| format!("cannot dial the installed listener at {}:{}", host, port))?;
        let gateway = Gateway::bootstrap(transport, id, spec, None)?;
        channel
            .wait_close(None)
            .context("the listener session did not hand off cleanly")?;
        Ok(gateway)
    }

    /// Look a member up by id.
    pub fn get(&self, id: &str) -> Option<Gateway> {
        self.inner
            .lock()
            .active
            .iter()
            .find(|gw| gw.id() == id)
            .cloned()
    }

    /// The members, in insertion order.
    pub fn gateways(&self) -> Vec<Gateway> {
        self.inner.lock().active.clone()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().active.is_empty()
    }

    /// Fan an execution request out to every member.
    pub fn remote_exec(&self, call: impl Into<ExecCall>) -> anyhow::Result<MultiChannel> {
        let call = call.into();
        let members = self.gateways();
        let mut channels = Vec::with_capacity(members.len());
        for gateway in &members {
            channels.push(gateway.remote_exec(call.clone())?);
        }
        Ok(MultiChannel::new(channels))
    }

    /// Exit every member, join receivers and reap endpoints. Members that
    /// outlive `timeout` have their transports killed, exactly once each;
    /// `None` waits forever and never kills.
    pub fn terminate(&self, timeout: Option<Duration>) -> anyhow::Result<()> {
        for gateway in self.gateways() {
            gateway.exit();
        }
        // exit moved members to the pending-join list; drain it
        let all: Vec<Gateway> = {
            let mut state = self.inner.lock();
            std::mem::take(&mut state.to_join)
        };
        if all.is_empty() {
            return Ok(());
        }
        let done = Arc::new(Event::new());
        let progress = Arc::new(AtomicUsize::new(0));
        let helper = {
            let all = all.clone();
            let done = done.clone();
            let progress = progress.clone();
            spawn_named("terminate helper", move || {
                for gateway in &all {
                    gateway.join(None);
                    gateway.reap_endpoint();
                    progress.fetch_add(1, Ordering::SeqCst);
                }
                done.set();
            })
            .context("cannot spawn the terminate helper")?
        };
        if !done.wait(timeout) {
            let stuck = progress.load(Ordering::SeqCst);
            warn!(
                "terminate timed out with {} endpoints left, killing them",
                all.len() - stuck
            );
            for gateway in all.iter().skip(stuck) {
                gateway.kill_endpoint();
            }
        }
        let _ = helper.join();
        Ok(())
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = self
            .inner
            .lock()
            .active
            .iter()
            .map(|gw| gw.id().to_owned())
            .join(", ");
        write!(f, "<Group [{}]>", ids)
    }
}

/// One channel per gateway of a fan-out, with fan-in helpers.
pub struct MultiChannel {
    channels: Vec<Channel>,
}

impl MultiChannel {
    pub(crate) fn new(channels: Vec<Channel>) -> MultiChannel {
        MultiChannel { channels }
    }

    /// The member channels, in gateway insertion order.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Number of member channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the fan-out is empty.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Send the same item through every channel.
    pub fn send_each(&self, item: impl Into<Item>) -> Result<(), ChannelError> {
        let item = item.into();
        for channel in &self.channels {
            channel.send(item.clone())?;
        }
        Ok(())
    }

    /// Receive one item from every channel, in order.
    pub fn receive_each(&self, timeout: Option<Duration>) -> Result<Vec<Item>, ChannelError> {
        self.channels
            .iter()
            .map(|channel| channel.receive(timeout))
            .collect()
    }

    /// Like [`MultiChannel::receive_each`], pairing each item with its
    /// channel.
    pub fn receive_each_with_channel(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Vec<(Channel, Item)>, ChannelError> {
        self.channels
            .iter()
            .map(|channel| Ok((channel.clone(), channel.receive(timeout)?)))
            .collect()
    }

    /// Merge all member channels into one queue of `(channel, item)`
    /// pairs via per-channel callbacks. With an endmarker, every channel
    /// contributes one final `(channel, endmarker)` pair when it closes.
    pub fn make_receive_queue(
        &self,
        endmarker: Option<Item>,
    ) -> Result<crossbeam_channel::Receiver<(Channel, Item)>, ChannelError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        for channel in &self.channels {
            let tx = tx.clone();
            let handle = channel.clone();
            let push = move |item| {
                let _ = tx.send((handle.clone(), item));
            };
            match &endmarker {
                Some(end) => channel.set_callback_with_endmarker(push, end.clone())?,
                None => channel.set_callback(push)?,
            }
        }
        Ok(rx)
    }

    /// Wait for every channel to close; re-raises the first error seen.
    pub fn wait_close(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let mut first: Option<ChannelError> = None;
        for channel in &self.channels {
            if let Err(err) = channel.wait_close(timeout) {
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
