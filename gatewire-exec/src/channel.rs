//! The channel layer: identity, state machine, receive queues, callbacks.
//!
//! A channel is a bidirectional, ordered conduit identified by an id that is
//! unique within one gateway pair. The master allocates odd ids, the worker
//! even ones, so independent allocation never collides. The factory owns
//! channel state strongly; channels hold only a weak reference to their
//! gateway, and dropping the last user handle of a still-open channel tells
//! the peer it will not be spoken to again.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use gatewire_proto::{dump, DumpError, Frame, MsgCode, Value};
use thiserror::Error;

use crate::execmodel::WAKE_INTERVAL;
use crate::gateway::GatewayLink;

/// An error raised on the peer during a remote execution, carried to this
/// side as formatted text. Displays verbatim.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RemoteError(pub String);

/// A channel operation failed.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Send or receive on a channel that is closed.
    #[error("channel {0} is closed")]
    Closed(u32),
    /// The owning gateway is not running anymore.
    #[error("gateway is not receiving anymore")]
    GatewayClosed,
    /// A bounded wait expired.
    #[error("operation timed out")]
    Timeout,
    /// The peer signalled end-of-stream and the queue has drained.
    #[error("end of channel")]
    Eof,
    /// The peer's execution failed; the text is its formatted error.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// `receive` on a channel that delivers through a callback.
    #[error("channel {0} already has a receiver callback")]
    CallbackRegistered(u32),
    /// Explicit `close` from inside the channel's own remote execution.
    #[error("cannot close a channel from inside its remote execution")]
    CloseInExecution,
    /// The item cannot be serialised.
    #[error(transparent)]
    Dump(#[from] DumpError),
    /// The wire write failed.
    #[error("gateway connection lost: {0}")]
    Io(#[from] io::Error),
}

/// One thing received from (or sendable to) a channel: a value, or another
/// channel travelling through this one.
#[derive(Debug, Clone)]
pub enum Item {
    /// A codec value.
    Value(Value),
    /// A channel handle.
    Channel(Channel),
}

impl Item {
    /// The value, if this item is one.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Item::Value(value) => Some(value),
            Item::Channel(_) => None,
        }
    }

    /// The channel, if this item is one.
    pub fn into_channel(self) -> Option<Channel> {
        match self {
            Item::Channel(channel) => Some(channel),
            Item::Value(_) => None,
        }
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Item) -> bool {
        match (self, other) {
            (Item::Value(a), Item::Value(b)) => a == b,
            (Item::Channel(a), Item::Channel(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Value> for Item {
    fn from(value: Value) -> Item {
        Item::Value(value)
    }
}

impl From<Channel> for Item {
    fn from(channel: Channel) -> Item {
        Item::Channel(channel)
    }
}

macro_rules! item_from_scalar {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Item {
            fn from(v: $ty) -> Item {
                Item::Value(Value::from(v))
            }
        })*
    };
}

item_from_scalar!(bool, i32, i64, u32, u64, f64, &str, String, Vec<u8>);

type Callback = Arc<dyn Fn(Item) + Send + Sync>;

enum QueueItem {
    Item(Item),
    End,
}

struct ChanMut {
    /// Receive queue; `None` once a callback owns delivery.
    items: Option<VecDeque<QueueItem>>,
    callback: Option<Callback>,
    /// Delivered to the callback once, at close. Taken on delivery.
    endmarker: Option<Item>,
    closed: bool,
    receive_closed: bool,
    executing: bool,
    remote_errors: Vec<RemoteError>,
    /// The live user-handle guard, shared by all clones of this channel.
    handle: Weak<ChannelHandle>,
}

pub(crate) struct ChannelState {
    id: u32,
    link: Weak<GatewayLink>,
    state: Mutex<ChanMut>,
    cond: Condvar,
}

impl ChannelState {
    fn new(id: u32, link: Weak<GatewayLink>) -> ChannelState {
        ChannelState {
            id,
            link,
            state: Mutex::new(ChanMut {
                items: Some(VecDeque::new()),
                callback: None,
                endmarker: None,
                closed: false,
                receive_closed: false,
                executing: false,
                remote_errors: Vec::new(),
                handle: Weak::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChanMut> {
        self.state.lock().expect("Cannot lock channel state")
    }

    pub(crate) fn set_executing(&self, executing: bool) {
        self.lock().executing = executing;
    }

    /// Mark the receive side closed, queue the end marker, and return the
    /// endmarker delivery that is now due, if any. The caller invokes it
    /// outside the lock.
    fn mark_receive_closed(
        &self,
        error: Option<RemoteError>,
        full_close: bool,
    ) -> Option<(Callback, Item)> {
        let mut guard = self.lock();
        let m = &mut *guard;
        if let Some(error) = error {
            m.remote_errors.push(error);
        }
        if full_close {
            m.closed = true;
        }
        m.receive_closed = true;
        if let Some(queue) = m.items.as_mut() {
            queue.push_back(QueueItem::End);
        }
        self.cond.notify_all();
        match (&m.callback, m.endmarker.take()) {
            (Some(callback), Some(end)) => Some((callback.clone(), end)),
            _ => None,
        }
    }

    /// Hook run when the last user handle is gone.
    fn handles_gone(self: &Arc<ChannelState>) {
        let (closed, receive_closed, has_callback, errors) = {
            let mut guard = self.lock();
            let m = &mut *guard;
            (
                m.closed,
                m.receive_closed,
                m.callback.is_some(),
                std::mem::take(&mut m.remote_errors),
            )
        };
        if closed {
            for error in errors {
                warn!(
                    "unhandled remote error on dropped channel {}: {}",
                    self.id, error
                );
            }
            return;
        }
        if receive_closed {
            // the peer is already done with this channel
            return;
        }
        let Some(link) = self.link.upgrade() else { return };
        trace!("channel {} dropped while open", self.id);
        if has_callback {
            // the callback keeps receiving; only the send side is given up
            let _ = link.send_frame(Frame::empty(MsgCode::ChannelLastMessage, self.id));
        } else {
            let _ = link.send_frame(Frame::empty(MsgCode::ChannelClose, self.id));
            self.lock().closed = true;
            link.factory.no_longer_opened(self.id);
        }
    }
}

/// Drop guard shared by every clone of one channel handle.
struct ChannelHandle {
    state: Arc<ChannelState>,
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.state.handles_gone();
    }
}

/// A bidirectional, ordered conduit to the peer.
///
/// Cloning is cheap and clones address the same channel. When the last
/// clone is dropped while the channel is still open, the peer is sent a
/// best-effort close (or last-message when a callback is installed).
#[derive(Clone)]
pub struct Channel {
    state: Arc<ChannelState>,
    _handle: Arc<ChannelHandle>,
}

impl PartialEq for Channel {
    fn eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = if self.is_closed() { "closed" } else { "open" };
        write!(f, "<Channel id={} {}>", self.id(), flag)
    }
}

impl Channel {
    fn from_state(state: Arc<ChannelState>) -> Channel {
        let handle = {
            let mut m = state.lock();
            match m.handle.upgrade() {
                Some(handle) => handle,
                None => {
                    let handle = Arc::new(ChannelHandle {
                        state: state.clone(),
                    });
                    m.handle = Arc::downgrade(&handle);
                    handle
                }
            }
        };
        Channel {
            state,
            _handle: handle,
        }
    }

    /// The gateway-unique channel id.
    pub fn id(&self) -> u32 {
        self.state.id
    }

    pub(crate) fn set_executing(&self, executing: bool) {
        self.state.set_executing(executing);
    }

    /// Whether the channel has been closed. Queued items may still drain.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Send an item to the peer.
    ///
    /// Sending a [`Channel`] introduces it on the other side; anything else
    /// goes through the codec. Fails once the channel is closed.
    pub fn send(&self, item: impl Into<Item>) -> Result<(), ChannelError> {
        let item = item.into();
        if self.state.lock().closed {
            return Err(ChannelError::Closed(self.id()));
        }
        let link = self
            .state
            .link
            .upgrade()
            .ok_or(ChannelError::GatewayClosed)?;
        let frame = match &item {
            Item::Channel(channel) => Frame::new(
                MsgCode::ChannelNew,
                self.id(),
                dump(&Value::Int(i64::from(channel.id())))?,
            ),
            Item::Value(value) => Frame::new(MsgCode::ChannelData, self.id(), dump(value)?),
        };
        link.send_frame(frame)?;
        Ok(())
    }

    /// Receive the next item, blocking up to `timeout` (`None` blocks until
    /// something arrives or the channel ends).
    ///
    /// End-of-stream re-queues its marker so sibling receivers observe it
    /// too, and surfaces the peer's stored error if one was attached.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Item, ChannelError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut m = self.state.lock();
        loop {
            let queue = match m.items.as_mut() {
                None => return Err(ChannelError::CallbackRegistered(self.id())),
                Some(queue) => queue,
            };
            match queue.pop_front() {
                Some(QueueItem::Item(item)) => return Ok(item),
                Some(QueueItem::End) => {
                    queue.push_front(QueueItem::End);
                    if !m.remote_errors.is_empty() {
                        return Err(ChannelError::Remote(m.remote_errors.remove(0)));
                    }
                    return Err(ChannelError::Eof);
                }
                None => {}
            }
            let step = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ChannelError::Timeout);
                    }
                    (deadline - now).min(WAKE_INTERVAL)
                }
                None => WAKE_INTERVAL,
            };
            let (guard, _) = self
                .state
                .cond
                .wait_timeout(m, step)
                .expect("Cannot wait on channel");
            m = guard;
        }
    }

    /// Install a receiver callback.
    ///
    /// Already-queued items are delivered synchronously before this
    /// returns; later items are delivered from the receiver task. After
    /// installation, [`Channel::receive`] fails. Callbacks must not block
    /// on the channel or install further callbacks.
    pub fn set_callback<F>(&self, callback: F) -> Result<(), ChannelError>
    where
        F: Fn(Item) + Send + Sync + 'static,
    {
        self.install_callback(Arc::new(callback), None)
    }

    /// Like [`Channel::set_callback`], and additionally deliver `endmarker`
    /// to the callback once when the channel closes.
    ///
    /// The endmarker is delivered iff the receiver loop observes the close;
    /// after a hard kill of the peer it is best-effort.
    pub fn set_callback_with_endmarker<F>(
        &self,
        callback: F,
        endmarker: impl Into<Item>,
    ) -> Result<(), ChannelError>
    where
        F: Fn(Item) + Send + Sync + 'static,
    {
        self.install_callback(Arc::new(callback), Some(endmarker.into()))
    }

    fn install_callback(
        &self,
        callback: Callback,
        endmarker: Option<Item>,
    ) -> Result<(), ChannelError> {
        let link = self.state.link.upgrade();
        // hold the receive lock so draining and installing are atomic with
        // respect to the receiver task
        let _receive_guard = link.as_ref().map(|link| link.lock_receive());
        let mut saw_end = false;
        let mut drained = Vec::new();
        {
            let mut m = self.state.lock();
            let queue = match m.items.as_mut() {
                None => return Err(ChannelError::CallbackRegistered(self.id())),
                Some(queue) => queue,
            };
            while let Some(queued) = queue.pop_front() {
                match queued {
                    QueueItem::Item(item) => drained.push(item),
                    QueueItem::End => {
                        queue.push_front(QueueItem::End);
                        saw_end = true;
                        break;
                    }
                }
            }
            if !saw_end {
                m.items = None;
                m.callback = Some(callback.clone());
                m.endmarker = endmarker.clone();
            }
        }
        for item in drained {
            callback(item);
        }
        if saw_end {
            if let Some(end) = endmarker {
                callback(end);
            }
        }
        Ok(())
    }

    /// Close the channel, optionally attaching an error text the peer will
    /// observe as a remote error.
    ///
    /// A channel bound to a remote execution closes automatically when the
    /// execution returns and cannot be closed explicitly from inside it.
    pub fn close(&self, error: Option<&str>) -> Result<(), ChannelError> {
        {
            let m = self.state.lock();
            if m.executing {
                return Err(ChannelError::CloseInExecution);
            }
            if m.closed {
                trace!("channel {} already closed", self.id());
                return Ok(());
            }
        }
        // closing twice in a race sends two close messages; that is harmless
        if let Some(link) = self.state.link.upgrade() {
            let frame = match error {
                Some(text) => Frame::new(
                    MsgCode::ChannelCloseError,
                    self.id(),
                    dump(&Value::Text(text.to_owned()))?,
                ),
                None => Frame::empty(MsgCode::ChannelClose, self.id()),
            };
            if let Err(err) = link.send_frame(frame) {
                trace!("channel {} close message not sent: {}", self.id(), err);
            }
        }
        let due = self.state.mark_receive_closed(None, true);
        if let Some((callback, end)) = due {
            callback(end);
        }
        if let Some(link) = self.state.link.upgrade() {
            link.factory.no_longer_opened(self.id());
        }
        Ok(())
    }

    /// Wait until the peer signalled it is done with this channel (or it
    /// was closed locally). Re-raises the stored remote error if any.
    pub fn wait_close(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut m = self.state.lock();
        while !m.receive_closed {
            let step = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ChannelError::Timeout);
                    }
                    (deadline - now).min(WAKE_INTERVAL)
                }
                None => WAKE_INTERVAL,
            };
            let (guard, _) = self
                .state
                .cond
                .wait_timeout(m, step)
                .expect("Cannot wait on channel");
            m = guard;
        }
        if !m.remote_errors.is_empty() {
            return Err(ChannelError::Remote(m.remote_errors.remove(0)));
        }
        Ok(())
    }

    /// A write adapter that turns `write` calls into `Bytes` sends.
    pub fn make_write_file(&self, proxyclose: bool) -> ChannelWriteFile {
        ChannelWriteFile {
            channel: self.clone(),
            proxyclose,
        }
    }

    /// A buffered read adapter over received `Bytes`/`Text` items.
    pub fn make_read_file(&self, proxyclose: bool) -> ChannelReadFile {
        ChannelReadFile {
            channel: self.clone(),
            proxyclose,
            buffer: VecDeque::new(),
            eof: false,
        }
    }
}

/// Per-gateway channel registry.
///
/// Tracks channel state by id and the local allocation counter. The two
/// sides of a gateway start their counters at different parities, so local
/// allocation never needs coordination.
pub(crate) struct ChannelFactory {
    inner: Mutex<FactoryInner>,
}

struct FactoryInner {
    channels: HashMap<u32, Arc<ChannelState>>,
    count: u32,
    finished: bool,
}

impl ChannelFactory {
    pub(crate) fn new(startcount: u32) -> ChannelFactory {
        ChannelFactory {
            inner: Mutex::new(FactoryInner {
                channels: HashMap::new(),
                count: startcount,
                finished: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FactoryInner> {
        self.inner.lock().expect("Cannot lock channel factory")
    }

    /// Allocate a fresh locally-owned channel.
    pub(crate) fn new_local(&self, link: &Arc<GatewayLink>) -> Result<Channel, ChannelError> {
        let state = {
            let mut inner = self.lock();
            if inner.finished {
                return Err(ChannelError::GatewayClosed);
            }
            let id = inner.count;
            inner.count += 2;
            let state = Arc::new(ChannelState::new(id, Arc::downgrade(link)));
            inner.channels.insert(id, state.clone());
            state
        };
        Ok(Channel::from_state(state))
    }

    /// Resolve a peer-announced id, creating a proxy if none exists.
    pub(crate) fn ensure_remote(&self, link: &Arc<GatewayLink>, id: u32) -> Channel {
        Channel::from_state(self.ensure_remote_state(link, id))
    }

    /// Like [`ChannelFactory::ensure_remote`], without minting a user
    /// handle (so pre-registering proxies does not trigger the drop hook).
    pub(crate) fn ensure_remote_state(
        &self,
        link: &Arc<GatewayLink>,
        id: u32,
    ) -> Arc<ChannelState> {
        let mut inner = self.lock();
        inner
            .channels
            .entry(id)
            .or_insert_with(|| Arc::new(ChannelState::new(id, Arc::downgrade(link))))
            .clone()
    }

    /// Hand out a handle for a registered channel id, if it is still live.
    pub(crate) fn resolve(&self, id: u32) -> Option<Channel> {
        let state = self.lock().channels.get(&id).cloned();
        state.map(Channel::from_state)
    }

    /// Number of live channels.
    pub(crate) fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// Deliver a received item: to the channel's callback if one is
    /// installed, else to its queue. Items for deleted channels are dropped.
    pub(crate) fn local_receive(&self, id: u32, item: Item) {
        let state = self.lock().channels.get(&id).cloned();
        let Some(state) = state else {
            trace!("dropping item for deleted channel {}", id);
            return;
        };
        let mut item = Some(item);
        let callback = {
            let mut m = state.lock();
            match m.callback.clone() {
                // deliver through the callback even if the channel has
                // closed in the meantime
                Some(callback) => Some(callback),
                None => {
                    if let Some(queue) = m.items.as_mut() {
                        queue.push_back(QueueItem::Item(
                            item.take().expect("item not yet delivered"),
                        ));
                        state.cond.notify_all();
                    }
                    None
                }
            }
        };
        if let (Some(callback), Some(item)) = (callback, item) {
            callback(item);
        }
    }

    /// Close a channel from the receiver side. `sendonly` leaves the local
    /// send half usable (the peer said it will not send anymore).
    pub(crate) fn local_close(&self, id: u32, error: Option<RemoteError>, sendonly: bool) {
        let state = self.lock().channels.get(&id).cloned();
        match state {
            None => {
                if let Some(error) = error {
                    warn!("unhandled remote error on deleted channel {}: {}", id, error);
                }
            }
            Some(state) => {
                if let Some((callback, end)) = state.mark_receive_closed(error, !sendonly) {
                    callback(end);
                }
            }
        }
        self.no_longer_opened(id);
    }

    /// Forget a channel.
    pub(crate) fn no_longer_opened(&self, id: u32) {
        self.lock().channels.remove(&id);
    }

    /// The receiver loop ended: every channel goes send-only, every pending
    /// endmarker fires, and no new channels can be allocated.
    pub(crate) fn finished_receiving(&self) {
        let channel_ids: Vec<u32> = {
            let mut inner = self.lock();
            inner.finished = true;
            inner.channels.keys().copied().collect()
        };
        for id in channel_ids {
            self.local_close(id, None, true);
        }
    }
}

/// `io::Write` over a channel; every write becomes one `Bytes` item.
pub struct ChannelWriteFile {
    channel: Channel,
    proxyclose: bool,
}

impl ChannelWriteFile {
    /// Finish writing; closes the channel if built with `proxyclose`.
    pub fn close(self) -> Result<(), ChannelError> {
        if self.proxyclose {
            self.channel.close(None)
        } else {
            Ok(())
        }
    }
}

impl Write for ChannelWriteFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.channel
            .send(Value::Bytes(buf.to_vec()))
            .map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffered `io::Read`/`BufRead` over a channel's `Bytes`/`Text` items.
pub struct ChannelReadFile {
    channel: Channel,
    proxyclose: bool,
    buffer: VecDeque<u8>,
    eof: bool,
}

impl ChannelReadFile {
    fn pull(&mut self) -> io::Result<()> {
        if self.eof {
            return Ok(());
        }
        match self.channel.receive(None) {
            Ok(Item::Value(Value::Bytes(bytes))) => self.buffer.extend(bytes),
            Ok(Item::Value(Value::Text(text))) => self.buffer.extend(text.into_bytes()),
            Ok(other) => {
                return Err(io::Error::other(format!(
                    "expected byte data on channel, got {:?}",
                    other
                )))
            }
            Err(ChannelError::Eof) => {
                self.eof = true;
                if self.proxyclose {
                    let _ = self.channel.close(None);
                }
            }
            Err(err) => return Err(io::Error::other(err)),
        }
        Ok(())
    }
}

impl Read for ChannelReadFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.buffer.is_empty() && !self.eof {
            self.pull()?;
        }
        let mut n = 0;
        while n < buf.len() {
            match self.buffer.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl io::BufRead for ChannelReadFile {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        while self.buffer.is_empty() && !self.eof {
            self.pull()?;
        }
        Ok(self.buffer.make_contiguous())
    }

    fn consume(&mut self, amt: usize) {
        self.buffer.drain(..amt.min(self.buffer.len()));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// A factory detached from any gateway: receive paths work, send paths
    /// report the gateway as gone.
    fn detached() -> (ChannelFactory, Channel) {
        let factory = ChannelFactory::new(1);
        let state = Arc::new(ChannelState::new(1, Weak::new()));
        factory.lock().channels.insert(1, state.clone());
        (factory, Channel::from_state(state))
    }

    #[test]
    fn receive_is_fifo_then_eof() {
        let (factory, ch) = detached();
        for i in 0..3 {
            factory.local_receive(1, Item::Value(Value::Int(i)));
        }
        factory.local_close(1, None, false);
        for i in 0..3 {
            assert_eq!(ch.receive(None).unwrap(), Item::Value(Value::Int(i)));
        }
        assert!(matches!(ch.receive(None), Err(ChannelError::Eof)));
        // the end marker stays for the next receiver too
        assert!(matches!(ch.receive(None), Err(ChannelError::Eof)));
    }

    #[test]
    fn remote_error_surfaces_once_then_eof() {
        let (factory, ch) = detached();
        factory.local_close(1, Some(RemoteError("kaputt".into())), false);
        match ch.receive(None) {
            Err(ChannelError::Remote(err)) => assert_eq!(err.to_string(), "kaputt"),
            other => panic!("expected remote error, got {:?}", other),
        }
        assert!(matches!(ch.receive(None), Err(ChannelError::Eof)));
    }

    #[test]
    fn receive_times_out() {
        let (_factory, ch) = detached();
        let start = Instant::now();
        assert!(matches!(
            ch.receive(Some(Duration::from_millis(50))),
            Err(ChannelError::Timeout)
        ));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn send_without_gateway_fails() {
        let (_factory, ch) = detached();
        assert!(matches!(
            ch.send(Value::Int(1)),
            Err(ChannelError::GatewayClosed)
        ));
    }

    #[test]
    fn callback_gets_queued_items_then_live_items_then_endmarker() {
        let (factory, ch) = detached();
        factory.local_receive(1, Item::Value(Value::Int(10)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ch.set_callback_with_endmarker(move |item| sink.lock().unwrap().push(item), Value::Int(-1))
            .unwrap();
        assert!(matches!(
            ch.receive(None),
            Err(ChannelError::CallbackRegistered(1))
        ));
        factory.local_receive(1, Item::Value(Value::Int(11)));
        factory.local_close(1, None, false);
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                Item::Value(Value::Int(10)),
                Item::Value(Value::Int(11)),
                Item::Value(Value::Int(-1)),
            ]
        );
    }

    #[test]
    fn endmarker_fires_exactly_once() {
        let (factory, ch) = detached();
        let count = Arc::new(Mutex::new(0usize));
        let counter = count.clone();
        ch.set_callback_with_endmarker(
            move |item| {
                if item == Item::Value(Value::Int(-1)) {
                    *counter.lock().unwrap() += 1;
                }
            },
            Value::Int(-1),
        )
        .unwrap();
        factory.local_close(1, None, false);
        factory.local_close(1, None, false);
        factory.finished_receiving();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn callback_on_ended_channel_delivers_endmarker_synchronously() {
        let (factory, ch) = detached();
        factory.local_receive(1, Item::Value(Value::Int(5)));
        factory.local_close(1, None, false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ch.set_callback_with_endmarker(
            move |item| sink.lock().unwrap().push(item),
            Value::from("end"),
        )
        .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Item::Value(Value::Int(5)), Item::Value(Value::from("end"))]
        );
    }

    #[test]
    fn finished_receiving_sets_send_only_and_wakes_waiters() {
        let (factory, ch) = detached();
        let waiter = {
            let ch = ch.clone();
            std::thread::spawn(move || ch.receive(None))
        };
        std::thread::sleep(Duration::from_millis(50));
        factory.finished_receiving();
        assert!(matches!(waiter.join().unwrap(), Err(ChannelError::Eof)));
        // send-only: the channel is not marked fully closed
        assert!(!ch.is_closed());
        assert_eq!(factory.channel_count(), 0);
    }

    #[test]
    fn wait_close_observes_local_close() {
        let (_factory, ch) = detached();
        ch.close(None).unwrap();
        ch.wait_close(Some(Duration::from_millis(100))).unwrap();
        assert!(ch.is_closed());
        assert!(matches!(ch.send(0i64), Err(ChannelError::Closed(1))));
    }

    #[test]
    fn close_is_forbidden_while_executing() {
        let (_factory, ch) = detached();
        ch.state.set_executing(true);
        assert!(matches!(
            ch.close(None),
            Err(ChannelError::CloseInExecution)
        ));
        ch.state.set_executing(false);
        ch.close(None).unwrap();
    }

    #[test]
    fn id_allocation_keeps_parity() {
        let factory = ChannelFactory::new(1);
        let ids: Vec<u32> = (0..3)
            .map(|_| {
                let mut inner = factory.lock();
                let id = inner.count;
                inner.count += 2;
                id
            })
            .collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }
}
