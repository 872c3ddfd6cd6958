use crate::channel::Channel;
use crate::config::Config;
use crate::error::RpcError;
use crate::event::{self, Event};
use crate::socket::Socket;
use crossfire::{mpsc, AsyncRx, MTx};
use futures::{pin_mut, select, FutureExt};
use log::{debug, info};
use rmpv::Value;

/// ZeroRPC client: a dealer endpoint multiplexing concurrent calls.
///
/// ```no_run
/// use zerorpc::{Client, Value};
///
/// # async fn run() -> Result<(), zerorpc::RpcError> {
/// let client = Client::connect("tcp://127.0.0.1:4242").await?;
/// let reply = client.invoke("hello", vec![Value::from("John")]).await?;
/// println!("{:?}", reply.args);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    socket: Socket,
}

impl Client {
    pub async fn connect(endpoint: &str) -> Result<Client, RpcError> {
        Self::connect_with(endpoint, Config::default()).await
    }

    pub async fn connect_with(endpoint: &str, config: Config) -> Result<Client, RpcError> {
        let socket = Socket::connect(endpoint, config).await?;
        info!("client connected to {}", endpoint);
        Ok(Client { socket })
    }

    /// Call `name` and wait for the single reply event.
    ///
    /// An `ERR` reply is translated into [`RpcError::Remote`] carrying
    /// the full event; a lost peer surfaces as
    /// [`RpcError::LostRemote`]. The call's channel is closed on
    /// return, success or failure.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Event, RpcError> {
        debug!("client invoking {}", name);
        let ch = self.socket.open_channel();
        let res = invoke_on(&ch, Event::new(name, args)).await;
        ch.close();
        res
    }

    /// Call `name` expecting a streamed reply: `STREAM` events followed
    /// by one terminal event (`STREAM_DONE`, `OK` or `ERR`).
    pub async fn invoke_stream(&self, name: &str, args: Vec<Value>) -> Result<CallStream, RpcError> {
        debug!("client invoking stream {}", name);
        let ch = self.socket.open_channel();
        if let Err(e) = ch.send_event(Event::new(name, args)).await {
            ch.close();
            return Err(e);
        }
        let (tx, rx) = mpsc::unbounded_async();
        tokio::spawn(forward_stream(ch, tx));
        Ok(CallStream { rx })
    }

    /// Close every in-flight channel, then the transport. Idempotent;
    /// also runs on drop.
    pub fn close(&self) {
        self.socket.close();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.socket.close();
    }
}

async fn invoke_on(ch: &Channel, ev: Event) -> Result<Event, RpcError> {
    ch.send_event(ev).await?;
    let reply = ch.recv_outbound().fuse();
    let failure = ch.recv_error().fuse();
    pin_mut!(reply, failure);
    select! {
        r = reply => match r {
            Ok(ev) => translate_reply(ev),
            Err(_) => Err(RpcError::ClosedChannel),
        },
        e = failure => match e {
            Ok(err) => Err(err),
            Err(_) => Err(RpcError::ClosedChannel),
        },
    }
}

fn translate_reply(ev: Event) -> Result<Event, RpcError> {
    if ev.name == event::EV_ERR {
        let name = ev.args.first().and_then(Value::as_str).unwrap_or("unknown").to_string();
        return Err(RpcError::Remote { name, event: ev });
    }
    Ok(ev)
}

/// Republish channel output onto the caller-visible stream until a
/// terminal event or channel failure, then close the channel. Dropping
/// the [`CallStream`] tears the forwarder down the same way.
async fn forward_stream(ch: Channel, tx: MTx<Result<Event, RpcError>>) {
    loop {
        let item = ch.recv_outbound().fuse();
        let failure = ch.recv_error().fuse();
        pin_mut!(item, failure);
        let (out, done) = select! {
            r = item => match r {
                Ok(ev) => {
                    let terminal = ev.name != event::EV_STREAM;
                    (Some(translate_reply(ev)), terminal)
                }
                Err(_) => (None, true),
            },
            e = failure => match e {
                Ok(err) => (Some(Err(err)), true),
                Err(_) => (None, true),
            },
        };
        if let Some(out) = out {
            if tx.send(out).is_err() {
                // caller dropped the stream
                break;
            }
        }
        if done {
            break;
        }
    }
    ch.close();
}

/// Streamed reply of one call: `STREAM` chunks followed by one terminal
/// event, after which the stream ends.
pub struct CallStream {
    rx: AsyncRx<Result<Event, RpcError>>,
}

impl CallStream {
    /// Next stream item; `None` once the call is finished.
    pub async fn recv(&self) -> Option<Result<Event, RpcError>> {
        self.rx.recv().await.ok()
    }
}
