use bytes::Bytes;
use captains_log::recipe;
use log::Level;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use zeromq::{Socket as ZmqSocket, SocketRecv, SocketSend, ZmqMessage};
use zerorpc::{Client, Config, Event, RpcError, Value};

fn setup() -> Runtime {
    let _ = recipe::raw_file_logger("/tmp/zerorpc_test", Level::Trace).test().build();
    Builder::new_multi_thread().worker_threads(4).enable_all().build().unwrap()
}

// A peer that accepts the connection but never sends anything, so no
// heartbeat ever reaches the client.
#[test]
fn test_lost_remote() {
    let rt = setup();
    rt.block_on(async {
        let mut router = zeromq::RouterSocket::new();
        let endpoint = router.bind("tcp://127.0.0.1:0").await.expect("bind").to_string();
        tokio::spawn(async move { while router.recv().await.is_ok() {} });

        let config = Config { heartbeat_freq: Duration::from_millis(500), buffer_size: 100 };
        let client = Client::connect_with(&endpoint, config).await.expect("client connect");
        let err = client.invoke("hello", Vec::new()).await.expect_err("peer is silent");
        assert_eq!(err, RpcError::LostRemote);
    });
}

// Heartbeats only advance the liveness clock; the consumer sees the
// actual reply, never a `_zpc_hb`.
#[test]
fn test_heartbeat_not_surfaced() {
    let rt = setup();
    rt.block_on(async {
        let mut router = zeromq::RouterSocket::new();
        let endpoint = router.bind("tcp://127.0.0.1:0").await.expect("bind").to_string();
        tokio::spawn(async move {
            let msg = router.recv().await.expect("recv request");
            let frames: Vec<Bytes> = msg.into_vec();
            let identity = frames.first().cloned().expect("identity frame");
            let request = Event::decode(frames.last().expect("payload")).expect("decode request");
            let call_id = request.message_id().expect("message id").to_string();

            let mut heartbeat = Event::heartbeat();
            heartbeat.header.insert("response_to".to_string(), Value::from(call_id.clone()));
            let mut reply = Event::new("OK", vec![Value::from("pong")]);
            reply.header.insert("response_to".to_string(), Value::from(call_id));
            for ev in [heartbeat, reply] {
                let mut msg = ZmqMessage::from(Bytes::from(ev.encode().expect("encode")));
                msg.push_front(identity.clone());
                router.send(msg).await.expect("send reply");
            }
        });

        let client = Client::connect(&endpoint).await.expect("client connect");
        let reply = client.invoke("ping", Vec::new()).await.expect("invoke");
        assert_eq!(reply.name, "OK");
        assert_eq!(reply.args, vec![Value::from("pong")]);
    });
}

// The client emits heartbeats on an open channel; a slow server must
// see them between the request and its own reply.
#[test]
fn test_client_emits_heartbeats() {
    let rt = setup();
    rt.block_on(async {
        let mut router = zeromq::RouterSocket::new();
        let endpoint = router.bind("tcp://127.0.0.1:0").await.expect("bind").to_string();
        let observer = tokio::spawn(async move {
            let msg = router.recv().await.expect("recv request");
            let frames: Vec<Bytes> = msg.into_vec();
            let identity = frames.first().cloned().expect("identity frame");
            let request = Event::decode(frames.last().expect("payload")).expect("decode request");
            let call_id = request.message_id().expect("message id").to_string();

            // wait for one client heartbeat before replying
            let mut heartbeats = 0usize;
            while heartbeats == 0 {
                let msg = router.recv().await.expect("recv more");
                let frames: Vec<Bytes> = msg.into_vec();
                let ev = Event::decode(frames.last().expect("payload")).expect("decode");
                if ev.name == "_zpc_hb" {
                    assert_eq!(ev.response_to(), Some(call_id.as_str()));
                    heartbeats += 1;
                }
            }
            let mut reply = Event::new("OK", Vec::new());
            reply.header.insert("response_to".to_string(), Value::from(call_id));
            let mut msg = ZmqMessage::from(Bytes::from(reply.encode().expect("encode")));
            msg.push_front(identity);
            router.send(msg).await.expect("send reply");
            heartbeats
        });

        let config = Config { heartbeat_freq: Duration::from_millis(200), buffer_size: 100 };
        let client = Client::connect_with(&endpoint, config).await.expect("client connect");
        let reply = client.invoke("slow", Vec::new()).await.expect("invoke");
        assert_eq!(reply.name, "OK");
        assert!(observer.await.expect("join") >= 1);
    });
}
