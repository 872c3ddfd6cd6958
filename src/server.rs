use crate::channel::ChannelInner;
use crate::config::Config;
use crate::error::RpcError;
use crate::event::{self, Event};
use crate::socket::Socket;
use futures::FutureExt;
use log::{debug, error, info, warn};
use rmpv::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;
type TaskFn = Box<dyn Fn(Vec<Value>) -> TaskFuture + Send + Sync>;
type StreamFuture = Pin<Box<dyn Future<Output = Result<(), RpcError>> + Send>>;
type StreamFn = Box<dyn Fn(Vec<Value>, StreamSink) -> StreamFuture + Send + Sync>;

enum TaskKind {
    Unary(TaskFn),
    Stream(StreamFn),
}

/// Named handlers installed on a server endpoint. Each inbound request
/// is dispatched to its handler on a dedicated task.
pub(crate) struct TaskRegistry {
    handlers: Mutex<HashMap<String, Arc<TaskKind>>>,
}

/// Push side of a streaming reply handed to a stream handler. Every
/// `send` emits one `STREAM` event within the window the peer has
/// granted, suspending when the window is exhausted.
pub struct StreamSink {
    ch: Arc<ChannelInner>,
}

impl StreamSink {
    pub async fn send(&self, chunk: Value) -> Result<(), RpcError> {
        self.ch.acquire_send_credit().await?;
        self.ch.send_event(Event::new(event::EV_STREAM, vec![chunk])).await
    }
}

/// ZeroRPC server: a router endpoint plus named task handlers.
///
/// ```no_run
/// use zerorpc::{Server, Value};
///
/// # async fn run() -> Result<(), zerorpc::RpcError> {
/// let server = Server::bind("tcp://0.0.0.0:4242").await?;
/// server.register_task("hello", |args: Vec<Value>| async move {
///     let who = args.first().and_then(Value::as_str).unwrap_or("world");
///     Ok(Value::from(format!("Hello, {}", who)))
/// })?;
/// server.listen().await;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    socket: Socket,
    tasks: Arc<TaskRegistry>,
}

impl Server {
    pub async fn bind(endpoint: &str) -> Result<Server, RpcError> {
        Self::bind_with(endpoint, Config::default()).await
    }

    /// Bind a router endpoint and install the task registry on it.
    pub async fn bind_with(endpoint: &str, config: Config) -> Result<Server, RpcError> {
        let socket = Socket::bind(endpoint, config).await?;
        let tasks = Arc::new(TaskRegistry { handlers: Mutex::new(HashMap::new()) });
        socket.set_server(tasks.clone());
        info!("server bound to {}", socket.local_endpoint().unwrap_or(endpoint));
        Ok(Server { socket, tasks })
    }

    /// The resolved endpoint; useful after binding port 0.
    pub fn local_endpoint(&self) -> Option<&str> {
        self.socket.local_endpoint()
    }

    /// Register a handler replying with a single value. The reply event
    /// is `OK([value])`, or `ERR([text, nil, nil])` if the handler
    /// fails.
    pub fn register_task<H, F>(&self, name: &str, handler: H) -> Result<(), RpcError>
    where
        H: Fn(Vec<Value>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let task: TaskFn = Box::new(move |args| -> TaskFuture { Box::pin(handler(args)) });
        self.tasks.install(name, TaskKind::Unary(task))
    }

    /// Register a handler streaming its reply through a [`StreamSink`].
    /// Completion emits `STREAM_DONE([])`, failure `ERR([text, nil,
    /// nil])`.
    pub fn register_stream_task<H, F>(&self, name: &str, handler: H) -> Result<(), RpcError>
    where
        H: Fn(Vec<Value>, StreamSink) -> F + Send + Sync + 'static,
        F: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let task: StreamFn =
            Box::new(move |args, sink| -> StreamFuture { Box::pin(handler(args, sink)) });
        self.tasks.install(name, TaskKind::Stream(task))
    }

    /// Drain and log the endpoint error stream; blocks until the
    /// endpoint closes.
    pub async fn listen(&self) {
        if let Some(errors) = self.socket.take_errors() {
            while let Ok(e) = errors.recv().await {
                error!("server socket error: {}", e);
            }
        }
    }

    /// Close every live channel, then the transport. Idempotent; also
    /// runs on drop.
    pub fn close(&self) {
        self.socket.close();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.socket.close();
    }
}

impl TaskRegistry {
    fn install(&self, name: &str, task: TaskKind) -> Result<(), RpcError> {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(name) {
            return Err(RpcError::DuplicateHandler(name.to_string()));
        }
        handlers.insert(name.to_string(), Arc::new(task));
        debug!("server registered handler for task {}", name);
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<Arc<TaskKind>> {
        self.handlers.lock().unwrap().get(name).cloned()
    }

    /// Run the handler for one inbound request on its own task. The
    /// task owns the channel and closes it after the terminal reply, so
    /// a slow handler never blocks dispatch.
    pub(crate) fn spawn_task(self: Arc<Self>, ch: Arc<ChannelInner>, ev: Event) {
        tokio::spawn(self.run_task(ch, ev));
    }

    async fn run_task(self: Arc<Self>, ch: Arc<ChannelInner>, ev: Event) {
        let name = ev.name;
        let args = ev.args;
        match self.lookup(&name) {
            None => {
                warn!("server has no handler for task {}", name);
                reply_err(&ch, &RpcError::NoTaskHandler(name).to_string()).await;
            }
            Some(task) => match &*task {
                TaskKind::Unary(handler) => {
                    debug!("server handling task {}", name);
                    match AssertUnwindSafe(handler(args)).catch_unwind().await {
                        Ok(Ok(value)) => {
                            let reply = Event::new(event::EV_OK, vec![value]);
                            if let Err(e) = ch.send_event(reply).await {
                                warn!("server reply for task {} failed: {}", name, e);
                            }
                        }
                        Ok(Err(e)) => reply_err(&ch, &e.to_string()).await,
                        Err(panic) => reply_err(&ch, &panic_text(panic)).await,
                    }
                }
                TaskKind::Stream(handler) => {
                    debug!("server handling stream task {}", name);
                    let sink = StreamSink { ch: ch.clone() };
                    match AssertUnwindSafe(handler(args, sink)).catch_unwind().await {
                        Ok(Ok(())) => {
                            let done = Event::new(event::EV_STREAM_DONE, Vec::new());
                            if let Err(e) = ch.send_event(done).await {
                                warn!("server stream end for task {} failed: {}", name, e);
                            }
                        }
                        Ok(Err(e)) => reply_err(&ch, &e.to_string()).await,
                        Err(panic) => reply_err(&ch, &panic_text(panic)).await,
                    }
                }
            },
        }
        ch.close();
    }
}

// First-class exception reply: args are `[text, nil, nil]`.
async fn reply_err(ch: &Arc<ChannelInner>, text: &str) {
    let reply = Event::new(event::EV_ERR, vec![Value::from(text), Value::Nil, Value::Nil]);
    if let Err(e) = ch.send_event(reply).await {
        debug!("server error reply dropped: {}", e);
    }
}

fn panic_text(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}
