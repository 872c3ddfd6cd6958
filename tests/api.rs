use captains_log::recipe;
use log::Level;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use zerorpc::{Client, RpcError, Server, Value};

fn setup() -> Runtime {
    let _ = recipe::raw_file_logger("/tmp/zerorpc_test", Level::Trace).test().build();
    Builder::new_multi_thread().worker_threads(4).enable_all().build().unwrap()
}

async fn bind_server() -> (Server, String) {
    let server = Server::bind("tcp://127.0.0.1:0").await.expect("server bind");
    let endpoint = server.local_endpoint().expect("local endpoint").to_string();
    (server, endpoint)
}

#[test]
fn test_echo_call() {
    let rt = setup();
    rt.block_on(async {
        let (server, endpoint) = bind_server().await;
        server
            .register_task("hello", |args: Vec<Value>| async move {
                let who = args.first().and_then(Value::as_str).unwrap_or("world");
                Ok(Value::from(format!("Hello, {}", who)))
            })
            .expect("register hello");

        let client = Client::connect(&endpoint).await.expect("client connect");
        let reply = client.invoke("hello", vec![Value::from("John")]).await.expect("invoke");
        assert_eq!(reply.name, "OK");
        assert_eq!(reply.args, vec![Value::from("Hello, John")]);
        assert!(reply.response_to().is_some());
    });
}

#[test]
fn test_remote_exception() {
    let rt = setup();
    rt.block_on(async {
        let (server, endpoint) = bind_server().await;
        server
            .register_task("explode", |_args: Vec<Value>| async move {
                Err::<Value, _>(RpcError::Text("boom".to_string()))
            })
            .expect("register explode");

        let client = Client::connect(&endpoint).await.expect("client connect");
        let err = client.invoke("explode", Vec::new()).await.expect_err("must fail");
        match err {
            RpcError::Remote { name, event } => {
                assert_eq!(name, "boom");
                assert_eq!(event.name, "ERR");
                assert_eq!(event.args[0], Value::from("boom"));
                assert_eq!(event.args[1], Value::Nil);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    });
}

#[test]
fn test_handler_panic_becomes_err() {
    let rt = setup();
    rt.block_on(async {
        let (server, endpoint) = bind_server().await;
        server
            .register_task("crash", |args: Vec<Value>| async move {
                if args.is_empty() {
                    panic!("wires crossed");
                }
                Ok(Value::Nil)
            })
            .expect("register crash");

        let client = Client::connect(&endpoint).await.expect("client connect");
        let err = client.invoke("crash", Vec::new()).await.expect_err("must fail");
        match err {
            RpcError::Remote { name, .. } => assert!(name.contains("wires crossed"), "{}", name),
            other => panic!("unexpected error: {:?}", other),
        }
    });
}

#[test]
fn test_duplicate_handler() {
    let rt = setup();
    rt.block_on(async {
        let (server, endpoint) = bind_server().await;
        let first_calls = Arc::new(AtomicUsize::new(0));
        let counter = first_calls.clone();
        server
            .register_task("x", move |_args: Vec<Value>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::from(1u64))
                }
            })
            .expect("register x");

        let err = server
            .register_task("x", |_args: Vec<Value>| async move { Ok(Value::from(2u64)) })
            .expect_err("second registration must fail");
        assert_eq!(err, RpcError::DuplicateHandler("x".to_string()));

        // calls keep dispatching to the first handler
        let client = Client::connect(&endpoint).await.expect("client connect");
        let reply = client.invoke("x", Vec::new()).await.expect("invoke");
        assert_eq!(reply.args, vec![Value::from(1u64)]);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn test_unknown_task() {
    let rt = setup();
    rt.block_on(async {
        let (_server, endpoint) = bind_server().await;
        let client = Client::connect(&endpoint).await.expect("client connect");
        let err = client.invoke("not_a_method", Vec::new()).await.expect_err("must fail");
        match err {
            RpcError::Remote { name, event } => {
                assert_eq!(name, "no handler for task not_a_method");
                assert_eq!(event.name, "ERR");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    });
}

#[test]
fn test_concurrent_calls() {
    let rt = setup();
    rt.block_on(async {
        let (server, endpoint) = bind_server().await;
        server
            .register_task("double", |args: Vec<Value>| async move {
                let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                Ok(Value::from(n * 2))
            })
            .expect("register double");

        let client = Arc::new(Client::connect(&endpoint).await.expect("client connect"));
        let mut joins = Vec::new();
        for i in 0..16i64 {
            let client = client.clone();
            joins.push(tokio::spawn(async move {
                client.invoke("double", vec![Value::from(i)]).await
            }));
        }
        for (i, join) in joins.into_iter().enumerate() {
            let reply = join.await.expect("join").expect("invoke");
            assert_eq!(reply.args, vec![Value::from(i as i64 * 2)]);
        }
    });
}

#[test]
fn test_invoke_after_close() {
    let rt = setup();
    rt.block_on(async {
        let (server, endpoint) = bind_server().await;
        server
            .register_task("noop", |_args: Vec<Value>| async move { Ok(Value::Nil) })
            .expect("register noop");

        let client = Client::connect(&endpoint).await.expect("client connect");
        client.invoke("noop", Vec::new()).await.expect("invoke before close");
        client.close();
        client.close(); // idempotent
        let err = client.invoke("noop", Vec::new()).await.expect_err("closed endpoint");
        assert!(matches!(err, RpcError::Transport(_)), "unexpected error: {:?}", err);
    });
}
