use crate::config::LIVENESS_TICK;
use crate::error::RpcError;
use crate::event::{self, Event};
use crate::socket::SocketInner;
use bytes::Bytes;
use crossfire::{mpsc, AsyncRx, MAsyncTx, MTx, RecvError};
use log::{debug, trace, warn};
use rmpv::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, Notify};

/// Caller-side handle to one logical call.
///
/// Dropping the handle cancels the call: the channel closes, no cancel
/// frame is emitted, and late replies are discarded by the endpoint.
pub(crate) struct Channel {
    inner: Arc<ChannelInner>,
    outbound_rx: AsyncMutex<AsyncRx<Event>>,
    errors_rx: AsyncMutex<AsyncRx<RpcError>>,
}

impl Channel {
    /// Originator-side channel; unregistered until the first send fixes
    /// its id.
    pub(crate) fn open(socket: Arc<SocketInner>) -> Channel {
        let (inner, outbound_rx, errors_rx, inbound_rx) = ChannelInner::new(socket, None, None);
        ChannelInner::spawn_loops(&inner, inbound_rx);
        Channel { inner, outbound_rx: AsyncMutex::new(outbound_rx), errors_rx: AsyncMutex::new(errors_rx) }
    }

    /// Send an event on the channel. The first send assigns the
    /// channel's id from the event's `message_id` and starts the
    /// heartbeat emitter; every later send is stamped with
    /// `response_to`.
    pub(crate) async fn send_event(&self, mut e: Event) -> Result<(), RpcError> {
        if self.inner.is_closed() {
            return Err(RpcError::ClosedChannel);
        }
        let assigned: Option<String>;
        {
            let mut id = self.inner.id.lock().unwrap();
            match id.as_deref() {
                Some(cid) => {
                    e.set_response_to(cid);
                    assigned = None;
                }
                None => {
                    let mid = match e.message_id() {
                        Some(mid) if !mid.is_empty() => mid.to_string(),
                        _ => return Err(RpcError::Codec("event without message_id".to_string())),
                    };
                    *id = Some(mid.clone());
                    assigned = Some(mid);
                }
            }
        }
        if let Some(mid) = assigned {
            self.inner.socket.register_channel(&mid, self.inner.clone());
            ChannelInner::start_heartbeats(&self.inner);
            trace!("channel {} opened by first send", mid);
        }
        self.inner.send_raw(&e).await
    }

    #[inline]
    pub(crate) async fn recv_outbound(&self) -> Result<Event, RecvError> {
        self.outbound_rx.lock().await.recv().await
    }

    #[inline]
    pub(crate) async fn recv_error(&self) -> Result<RpcError, RecvError> {
        self.errors_rx.lock().await.recv().await
    }

    pub(crate) fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// Shared per-call state. The endpoint registry and the channel's own
/// loops hold this behind an `Arc`; the channel never owns its socket.
pub(crate) struct ChannelInner {
    socket: Arc<SocketInner>,
    /// Immutable once assigned: the `message_id` of the first outbound
    /// event (originator) or of the opening request (responder).
    id: Mutex<Option<String>>,
    /// Routing prefix of the peer, router-side only.
    peer_identity: Option<Bytes>,
    closed: AtomicBool,
    hb_started: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    inbound_tx: Mutex<Option<MAsyncTx<Event>>>,
    inbound_used: AtomicUsize,
    outbound_tx: Mutex<Option<MTx<Event>>>,
    errors_tx: Mutex<Option<MTx<RpcError>>>,
    /// Window for outgoing `STREAM` events; the peer's `_zpc_more`
    /// grants replace it.
    send_credit: Mutex<usize>,
    credit_wake: Notify,
}

impl ChannelInner {
    fn new(
        socket: Arc<SocketInner>, id: Option<String>, peer_identity: Option<Bytes>,
    ) -> (Arc<ChannelInner>, AsyncRx<Event>, AsyncRx<RpcError>, AsyncRx<Event>) {
        let buffer = socket.config().buffer_size;
        let (inbound_tx, inbound_rx) = mpsc::bounded_async::<Event>(buffer);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_async::<Event>();
        let (errors_tx, errors_rx) = mpsc::unbounded_async::<RpcError>();
        let inner = Arc::new(ChannelInner {
            socket,
            id: Mutex::new(id),
            peer_identity,
            closed: AtomicBool::new(false),
            hb_started: AtomicBool::new(false),
            last_heartbeat: Mutex::new(Instant::now()),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_used: AtomicUsize::new(0),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            errors_tx: Mutex::new(Some(errors_tx)),
            // the peer may send one unsolicited chunk before the first grant
            send_credit: Mutex::new(1),
            credit_wake: Notify::new(),
        });
        (inner, outbound_rx, errors_rx, inbound_rx)
    }

    /// Responder-side channel for a fresh inbound call: registered under
    /// the request's `message_id` and heartbeating immediately.
    pub(crate) fn accept(
        socket: Arc<SocketInner>, id: String, peer_identity: Option<Bytes>,
    ) -> Arc<ChannelInner> {
        let (inner, _outbound_rx, _errors_rx, inbound_rx) =
            Self::new(socket, Some(id.clone()), peer_identity);
        inner.socket.register_channel(&id, inner.clone());
        Self::spawn_loops(&inner, inbound_rx);
        Self::start_heartbeats(&inner);
        debug!("socket created new channel {}", id);
        inner
    }

    fn spawn_loops(ch: &Arc<ChannelInner>, inbound_rx: AsyncRx<Event>) {
        tokio::spawn(ch.clone().inbound_loop(inbound_rx));
        tokio::spawn(ch.clone().liveness_loop());
    }

    fn start_heartbeats(ch: &Arc<ChannelInner>) {
        if ch.hb_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(ch.clone().heartbeat_loop());
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn current_id(&self) -> Option<String> {
        self.id.lock().unwrap().clone()
    }

    /// Stamp `response_to` with the channel id and send. Every path
    /// where the id is already fixed goes through here: replies,
    /// heartbeats, credit grants, stream chunks.
    pub(crate) async fn send_event(&self, mut e: Event) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ClosedChannel);
        }
        match self.current_id() {
            Some(id) => e.set_response_to(&id),
            None => return Err(RpcError::ClosedChannel),
        }
        self.send_raw(&e).await
    }

    async fn send_raw(&self, e: &Event) -> Result<(), RpcError> {
        trace!("channel {:?} sending event {:?}", self.current_id(), e.message_id());
        self.socket.send_event(e, self.peer_identity.clone()).await
    }

    /// Deliver one inbound event; called only by the endpoint
    /// dispatcher. Suspends when the queue is full.
    pub(crate) async fn push_inbound(&self, ev: Event) {
        let tx = self.inbound_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            self.inbound_used.fetch_add(1, Ordering::SeqCst);
            if tx.send(ev).await.is_err() {
                self.inbound_used.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Free space in the inbound queue; this is the credit advertised
    /// to a streaming peer.
    fn free_buffer(&self) -> usize {
        self.socket.config().buffer_size.saturating_sub(self.inbound_used.load(Ordering::SeqCst))
    }

    async fn inbound_loop(self: Arc<Self>, rx: AsyncRx<Event>) {
        let mut stream_credit: usize = 0;
        while let Ok(ev) = rx.recv().await {
            self.inbound_used.fetch_sub(1, Ordering::SeqCst);
            if self.is_closed() {
                break;
            }
            let name = ev.name.clone();
            match name.as_str() {
                event::EV_OK | event::EV_ERR => self.forward(ev),
                event::EV_STREAM => {
                    self.forward(ev);
                    if stream_credit == 0 {
                        let free = self.free_buffer();
                        if free > 0 {
                            let grant =
                                Event::new(event::EV_MORE, vec![Value::from(free as u64)]);
                            match self.send_event(grant).await {
                                Ok(()) => stream_credit = free - 1,
                                Err(e) => debug!(
                                    "channel {:?} credit grant failed: {}",
                                    self.current_id(),
                                    e
                                ),
                            }
                        }
                    } else {
                        stream_credit -= 1;
                    }
                }
                event::EV_STREAM_DONE => {
                    self.forward(ev);
                    stream_credit = 0;
                }
                event::EV_HEARTBEAT => {
                    trace!("channel {:?} received heartbeat", self.current_id());
                    *self.last_heartbeat.lock().unwrap() = Instant::now();
                }
                event::EV_MORE => {
                    let granted = ev.args.first().and_then(Value::as_u64).unwrap_or(0);
                    self.grant_send_credit(granted as usize);
                }
                name if name.starts_with(event::RESERVED_PREFIX) => {
                    trace!("channel {:?} ignoring reserved event {}", self.current_id(), name);
                }
                _ => match self.socket.server() {
                    Some(tasks) => {
                        trace!("channel {:?} handling task {}", self.current_id(), name);
                        tasks.spawn_task(self.clone(), ev);
                    }
                    None => {
                        trace!("channel {:?} dropping task event {}", self.current_id(), name)
                    }
                },
            }
        }
        trace!("channel {:?} inbound loop exited", self.current_id());
    }

    fn forward(&self, ev: Event) {
        let tx = self.outbound_tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(ev);
        }
    }

    /// Suspend until the peer's window admits one more `STREAM` event,
    /// then consume one credit.
    pub(crate) async fn acquire_send_credit(&self) -> Result<(), RpcError> {
        loop {
            let wait = self.credit_wake.notified();
            tokio::pin!(wait);
            wait.as_mut().enable();
            {
                if self.is_closed() {
                    return Err(RpcError::ClosedChannel);
                }
                let mut credit = self.send_credit.lock().unwrap();
                if *credit > 0 {
                    *credit -= 1;
                    return Ok(());
                }
            }
            wait.await;
        }
    }

    // A grant announces the total the peer will accept until its next
    // grant, so it replaces the window rather than adding to it.
    fn grant_send_credit(&self, n: usize) {
        *self.send_credit.lock().unwrap() = n;
        trace!("channel {:?} granted send credit {}", self.current_id(), n);
        self.credit_wake.notify_waiters();
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let freq = self.socket.config().heartbeat_freq;
        loop {
            tokio::time::sleep(freq).await;
            if self.is_closed() {
                return;
            }
            if let Err(e) = self.send_event(Event::heartbeat()).await {
                debug!("channel {:?} heartbeat emitter stopped: {}", self.current_id(), e);
                return;
            }
            trace!("channel {:?} sent heartbeat", self.current_id());
        }
    }

    async fn liveness_loop(self: Arc<Self>) {
        let deadline = self.socket.config().heartbeat_freq * 2;
        loop {
            tokio::time::sleep(LIVENESS_TICK).await;
            if self.is_closed() {
                return;
            }
            let silent = self.last_heartbeat.lock().unwrap().elapsed();
            if silent > deadline {
                warn!("channel {:?} lost remote after {:?} of silence", self.current_id(), silent);
                self.fail(RpcError::LostRemote);
                return;
            }
        }
    }

    /// Publish a terminal error and close; the error queue carries at
    /// most one value.
    fn fail(&self, e: RpcError) {
        {
            let tx = self.errors_tx.lock().unwrap();
            if let Some(tx) = tx.as_ref() {
                let _ = tx.send(e);
            }
        }
        self.close();
    }

    /// Flip to closed, deregister from the endpoint and drop every
    /// queue sender so the loops and any waiting consumer unblock.
    /// Idempotent; closed is terminal.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.current_id() {
            self.socket.remove_channel(&id);
        }
        self.inbound_tx.lock().unwrap().take();
        self.outbound_tx.lock().unwrap().take();
        self.errors_tx.lock().unwrap().take();
        self.credit_wake.notify_waiters();
        debug!("channel {:?} closed", self.current_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::socket::Socket;
    use zeromq::{Socket as ZmqSocket, SocketRecv};

    #[test]
    fn test_send_on_closed_channel() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            // a silent peer is enough, the channel only has to send
            let mut router = zeromq::RouterSocket::new();
            let endpoint = router.bind("tcp://127.0.0.1:0").await.expect("bind").to_string();
            tokio::spawn(async move { while router.recv().await.is_ok() {} });

            let socket = Socket::connect(&endpoint, Config::default()).await.expect("connect");
            let ch = socket.open_channel();
            ch.send_event(Event::new("ping", Vec::new())).await.expect("first send");
            ch.close();
            let err = ch.send_event(Event::new("ping", Vec::new())).await.expect_err("closed");
            assert_eq!(err, RpcError::ClosedChannel);
            // close is idempotent
            ch.close();
            socket.close();
        });
    }

    #[test]
    fn test_credit_replaced_by_grant() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut router = zeromq::RouterSocket::new();
            let endpoint = router.bind("tcp://127.0.0.1:0").await.expect("bind").to_string();
            tokio::spawn(async move { while router.recv().await.is_ok() {} });

            let socket = Socket::connect(&endpoint, Config::default()).await.expect("connect");
            let ch = socket.open_channel();
            ch.send_event(Event::new("ping", Vec::new())).await.expect("send");
            // initial window admits exactly one chunk
            ch.inner.acquire_send_credit().await.expect("initial credit");
            ch.inner.grant_send_credit(2);
            ch.inner.acquire_send_credit().await.expect("granted credit");
            ch.inner.acquire_send_credit().await.expect("granted credit");
            // window exhausted again; closing unblocks the waiter
            let inner = ch.inner.clone();
            let waiter = tokio::spawn(async move { inner.acquire_send_credit().await });
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            ch.close();
            let res = waiter.await.expect("join");
            assert_eq!(res, Err(RpcError::ClosedChannel));
            socket.close();
        });
    }
}
