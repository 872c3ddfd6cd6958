use crate::channel::{Channel, ChannelInner};
use crate::config::Config;
use crate::error::RpcError;
use crate::event::Event;
use crate::server::TaskRegistry;
use crate::transport::{Mode, Transport};
use bytes::Bytes;
use crossfire::{mpsc, AsyncRx, MTx};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One transport endpoint, multiplexing every live call over a single
/// dealer or router socket.
pub(crate) struct Socket {
    inner: Arc<SocketInner>,
}

pub(crate) struct SocketInner {
    transport: Transport,
    config: Config,
    channels: Mutex<HashMap<String, Arc<ChannelInner>>>,
    server: Mutex<Option<Arc<TaskRegistry>>>,
    closed: AtomicBool,
    errors_tx: Mutex<Option<MTx<RpcError>>>,
    errors_rx: Mutex<Option<AsyncRx<RpcError>>>,
}

impl Socket {
    pub(crate) async fn connect(endpoint: &str, config: Config) -> Result<Self, RpcError> {
        let transport = Transport::connect(endpoint).await?;
        Ok(Self::start(transport, config))
    }

    pub(crate) async fn bind(endpoint: &str, config: Config) -> Result<Self, RpcError> {
        let transport = Transport::bind(endpoint).await?;
        Ok(Self::start(transport, config))
    }

    fn start(transport: Transport, config: Config) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_async::<RpcError>();
        let inner = Arc::new(SocketInner {
            transport,
            config,
            channels: Mutex::new(HashMap::new()),
            server: Mutex::new(None),
            closed: AtomicBool::new(false),
            errors_tx: Mutex::new(Some(errors_tx)),
            errors_rx: Mutex::new(Some(errors_rx)),
        });
        tokio::spawn(inner.clone().dispatch_loop());
        Socket { inner }
    }

    pub(crate) fn local_endpoint(&self) -> Option<&str> {
        self.inner.transport.local_endpoint()
    }

    /// Install the server hook dispatching inbound task events.
    pub(crate) fn set_server(&self, tasks: Arc<TaskRegistry>) {
        *self.inner.server.lock().unwrap() = Some(tasks);
    }

    /// Take the endpoint error stream; there is a single consumer.
    pub(crate) fn take_errors(&self) -> Option<AsyncRx<RpcError>> {
        self.inner.errors_rx.lock().unwrap().take()
    }

    /// Fresh originator-side channel; its id is fixed by the first send.
    pub(crate) fn open_channel(&self) -> Channel {
        Channel::open(self.inner.clone())
    }

    /// Close every channel, then the transport. Idempotent.
    pub(crate) fn close(&self) {
        self.inner.close();
    }
}

impl SocketInner {
    #[inline]
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    fn is_router(&self) -> bool {
        self.transport.mode() == Mode::Router
    }

    pub(crate) fn server(&self) -> Option<Arc<TaskRegistry>> {
        self.server.lock().unwrap().clone()
    }

    /// Serialize and dispatch one event. Router mode requires the
    /// target channel's peer identity to route the message.
    pub(crate) async fn send_event(&self, e: &Event, identity: Option<Bytes>) -> Result<(), RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Transport("socket closed".to_string()));
        }
        let payload = e.encode()?;
        if self.is_router() {
            return match identity {
                Some(id) if !id.is_empty() => self.transport.send(Some(id), payload).await,
                _ => Err(RpcError::Routing),
            };
        }
        self.transport.send(None, payload).await
    }

    pub(crate) fn register_channel(&self, id: &str, ch: Arc<ChannelInner>) {
        let mut channels = self.channels.lock().unwrap();
        if channels.insert(id.to_string(), ch).is_some() {
            warn!("channel {} replaced an existing registration", id);
        }
    }

    pub(crate) fn remove_channel(&self, id: &str) {
        self.channels.lock().unwrap().remove(id);
    }

    fn lookup_channel(&self, id: &str) -> Option<Arc<ChannelInner>> {
        self.channels.lock().unwrap().get(id).cloned()
    }

    fn publish_error(&self, e: RpcError) {
        if let Some(tx) = self.errors_tx.lock().unwrap().as_ref() {
            let _ = tx.send(e);
        }
    }

    /// Route every inbound frame to its channel for the lifetime of the
    /// endpoint. Recv and decode failures are published and the loop
    /// keeps receiving.
    async fn dispatch_loop(self: Arc<Self>) {
        let incoming = match self.transport.take_incoming() {
            Some(incoming) => incoming,
            None => return,
        };
        debug!("socket listening for incoming events");
        while let Ok(item) = incoming.recv().await {
            let frames = match item {
                Ok(frames) => frames,
                Err(e) => {
                    self.publish_error(e);
                    continue;
                }
            };
            let payload = match frames.last() {
                Some(payload) => payload,
                None => continue,
            };
            let ev = match Event::decode(payload) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!("socket dropping undecodable frame: {}", e);
                    self.publish_error(e);
                    continue;
                }
            };
            match ev.response_to().map(str::to_string) {
                Some(rt) => {
                    if let Some(ch) = self.lookup_channel(&rt) {
                        if !ch.is_closed() {
                            trace!("socket routing event {:?} to channel {}", ev.message_id(), rt);
                            ch.push_inbound(ev).await;
                            continue;
                        }
                    }
                    // late frame for a closed or unknown channel
                    trace!("socket dropping event for channel {}", rt);
                }
                None => {
                    let id = match ev.message_id() {
                        Some(id) if !id.is_empty() => id.to_string(),
                        _ => {
                            warn!("socket dropping event without message_id");
                            continue;
                        }
                    };
                    if self.lookup_channel(&id).is_some() {
                        warn!("socket dropping new call colliding with live channel {}", id);
                        continue;
                    }
                    let identity = if self.is_router() && frames.len() > 1 {
                        frames.first().cloned()
                    } else {
                        None
                    };
                    let ch = ChannelInner::accept(self.clone(), id, identity);
                    ch.push_inbound(ev).await;
                }
            }
        }
        debug!("socket dispatch loop exited");
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channels: Vec<Arc<ChannelInner>> = {
            let mut map = self.channels.lock().unwrap();
            map.drain().map(|(_, ch)| ch).collect()
        };
        for ch in channels {
            ch.close();
        }
        self.transport.close();
        self.errors_tx.lock().unwrap().take();
        debug!("socket closed");
    }
}
