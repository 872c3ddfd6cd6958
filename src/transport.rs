use crate::error::RpcError;
use bytes::Bytes;
use crossfire::{mpsc, AsyncRx, MTx};
use log::{debug, trace, warn};
use std::sync::Mutex;
use tokio::sync::oneshot;
use zeromq::{DealerSocket, RouterSocket, Socket as ZmqSocket, SocketRecv, SocketSend, ZmqMessage};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Mode {
    /// Client side, `connect`. Outgoing messages carry an empty
    /// delimiter frame before the payload.
    Dealer,
    /// Server side, `bind`. Outgoing messages carry the peer identity
    /// as the routing frame before the payload.
    Router,
}

type OutMsg = (ZmqMessage, oneshot::Sender<Result<(), RpcError>>);

/// Adapter over one ZeroMQ-style socket.
///
/// The socket itself lives on a dedicated I/O task; sends are funneled
/// through a queue (one at a time, acknowledged per message) and
/// received multipart messages flow out on another. Dropping the close
/// sender shuts the task down.
pub(crate) struct Transport {
    mode: Mode,
    local: Option<String>,
    out_tx: MTx<OutMsg>,
    in_rx: Mutex<Option<AsyncRx<Result<Vec<Bytes>, RpcError>>>>,
    close_tx: Mutex<Option<MTx<()>>>,
}

impl Transport {
    pub(crate) async fn connect(endpoint: &str) -> Result<Self, RpcError> {
        let mut socket = DealerSocket::new();
        socket.connect(endpoint).await?;
        debug!("dealer transport connected to {}", endpoint);
        Ok(Self::start(Mode::Dealer, None, socket))
    }

    pub(crate) async fn bind(endpoint: &str) -> Result<Self, RpcError> {
        let mut socket = RouterSocket::new();
        let resolved = socket.bind(endpoint).await?;
        debug!("router transport bound to {}", resolved);
        Ok(Self::start(Mode::Router, Some(resolved.to_string()), socket))
    }

    fn start<S>(mode: Mode, local: Option<String>, socket: S) -> Self
    where S: SocketRecv + SocketSend + Send + 'static {
        let (out_tx, out_rx) = mpsc::unbounded_async::<OutMsg>();
        let (in_tx, in_rx) = mpsc::unbounded_async::<Result<Vec<Bytes>, RpcError>>();
        let (close_tx, close_rx) = mpsc::unbounded_async::<()>();
        tokio::spawn(io_loop(socket, out_rx, in_tx, close_rx));
        Transport {
            mode,
            local,
            out_tx,
            in_rx: Mutex::new(Some(in_rx)),
            close_tx: Mutex::new(Some(close_tx)),
        }
    }

    #[inline]
    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    /// The resolved endpoint of a bound socket.
    pub(crate) fn local_endpoint(&self) -> Option<&str> {
        self.local.as_deref()
    }

    /// Dispatch one multipart message and wait for the socket write.
    /// Dealer mode prepends the empty delimiter frame, router mode the
    /// identity frame; an empty router identity is rejected upstream.
    pub(crate) async fn send(&self, identity: Option<Bytes>, payload: Vec<u8>) -> Result<(), RpcError> {
        let mut msg = ZmqMessage::from(Bytes::from(payload));
        match self.mode {
            Mode::Dealer => msg.push_front(Bytes::new()),
            Mode::Router => match identity {
                Some(id) if !id.is_empty() => msg.push_front(id),
                _ => return Err(RpcError::Routing),
            },
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.out_tx.send((msg, ack_tx)).is_err() {
            return Err(RpcError::Transport("transport closed".to_string()));
        }
        match ack_rx.await {
            Ok(r) => r,
            Err(_) => Err(RpcError::Transport("transport closed".to_string())),
        }
    }

    /// Take the incoming message queue; the dispatch loop is its single
    /// consumer. Items are multipart frames or recv errors to publish;
    /// the queue ends when the transport is gone.
    pub(crate) fn take_incoming(&self) -> Option<AsyncRx<Result<Vec<Bytes>, RpcError>>> {
        self.in_rx.lock().unwrap().take()
    }

    pub(crate) fn close(&self) {
        self.close_tx.lock().unwrap().take();
    }
}

async fn io_loop<S>(
    mut socket: S, out_rx: AsyncRx<OutMsg>, in_tx: MTx<Result<Vec<Bytes>, RpcError>>,
    close_rx: AsyncRx<()>,
) where
    S: SocketRecv + SocketSend + Send + 'static,
{
    enum Step {
        In(Result<ZmqMessage, zeromq::ZmqError>),
        Out(Option<OutMsg>),
        Close,
    }
    loop {
        let step = tokio::select! {
            r = socket.recv() => Step::In(r),
            o = out_rx.recv() => Step::Out(o.ok()),
            _ = close_rx.recv() => Step::Close,
        };
        match step {
            Step::In(Ok(msg)) => {
                let frames = msg.into_vec();
                trace!("transport received {} frames", frames.len());
                if in_tx.send(Ok(frames)).is_err() {
                    break;
                }
            }
            Step::In(Err(e)) => {
                warn!("transport recv error: {}", e);
                if in_tx.send(Err(RpcError::from(e))).is_err() {
                    break;
                }
            }
            Step::Out(Some((msg, ack))) => {
                let r = socket.send(msg).await.map_err(RpcError::from);
                let _ = ack.send(r);
            }
            Step::Out(None) | Step::Close => break,
        }
    }
    trace!("transport io loop exited");
}
