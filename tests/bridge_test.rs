use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf, duplex,
    split,
};
use worker_bridge::config::BridgeConfig;
use worker_bridge::sink::{ChannelSink, PushSink};
use worker_bridge::worker_channel::{Id, Request, Response, WorkerState};
use worker_bridge::{Bridge, BridgeError, Dispatched};

struct FakeWorker {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    out: WriteHalf<DuplexStream>,
}

impl FakeWorker {
    async fn next_message(&mut self) -> Value {
        let line = self
            .lines
            .next_line()
            .await
            .expect("read from bridge")
            .expect("bridge closed the pipe");
        serde_json::from_str(&line).expect("bridge wrote valid JSON")
    }

    async fn write_raw(&mut self, bytes: &[u8]) {
        self.out.write_all(bytes).await.unwrap();
        self.out.flush().await.unwrap();
    }

    async fn reply(&mut self, value: Value) {
        self.write_raw(format!("{value}\n").as_bytes()).await;
    }
}

fn config() -> BridgeConfig {
    BridgeConfig {
        handshake_delay_ms: 0,
        request_timeout_ms: 5_000,
        ..BridgeConfig::default()
    }
}

async fn connect(config: BridgeConfig) -> (Bridge, FakeWorker) {
    let (bridge_side, worker_side) = duplex(1 << 20);
    let (reader, writer) = split(bridge_side);
    let bridge = Bridge::from_io("fake-worker", reader, writer, config);

    let (worker_reader, worker_writer) = split(worker_side);
    let mut worker = FakeWorker {
        lines: BufReader::new(worker_reader).lines(),
        out: worker_writer,
    };
    let init = worker.next_message().await;
    assert_eq!(init["method"], "initialize");
    bridge.wait_until_ready().await.unwrap();
    (bridge, worker)
}

fn spawn_dispatch(
    bridge: &Bridge,
    request: Request,
    session_id: Option<&str>,
) -> tokio::task::JoinHandle<Dispatched> {
    let multiplexer = bridge.multiplexer().clone();
    let session_id = session_id.map(str::to_string);
    tokio::spawn(async move {
        multiplexer
            .dispatch(request, session_id.as_deref(), None)
            .await
    })
}

fn error_kind(response: &Response) -> &str {
    response
        .error
        .as_ref()
        .and_then(|e| e.data.as_ref())
        .and_then(|d| d["kind"].as_str())
        .unwrap_or_default()
}

#[tokio::test]
async fn tools_list_round_trip_creates_a_session() {
    let (bridge, mut worker) = connect(config()).await;

    let call = spawn_dispatch(&bridge, Request::call("1", "tools/list", None), None);
    assert_eq!(
        worker.next_message().await,
        json!({"jsonrpc":"2.0","id":"1","method":"tools/list"})
    );
    let reply = json!({"jsonrpc":"2.0","id":"1","result":{"tools":[]}});
    worker.reply(reply.clone()).await;

    let dispatched = call.await.unwrap();
    assert_eq!(serde_json::to_value(&dispatched.response).unwrap(), reply);

    let session = dispatched.session_id.expect("a session was created");
    assert!(bridge.sessions().contains(&session));
    assert_eq!(bridge.sessions().history(&session).unwrap().len(), 1);
    assert!(bridge.pending().is_empty());
}

#[tokio::test]
async fn concurrent_requests_resolve_in_reverse_order() {
    let (bridge, mut worker) = connect(config()).await;

    let calls: Vec<_> = (0..16i64)
        .map(|n| spawn_dispatch(&bridge, Request::call(n, "echo", Some(json!({"n": n}))), None))
        .collect();

    let mut seen = Vec::new();
    for _ in 0..16 {
        seen.push(worker.next_message().await["id"].as_i64().unwrap());
    }
    assert_eq!(bridge.pending().len(), 16);

    for n in seen.iter().rev() {
        worker
            .reply(json!({"jsonrpc":"2.0","id":n,"result":{"n":n}}))
            .await;
    }

    let results = futures::future::join_all(calls).await;
    for (n, dispatched) in results.into_iter().enumerate() {
        let response = dispatched.unwrap().response;
        assert_eq!(response.id, Id::Number(n as i64));
        assert_eq!(response.result, Some(json!({"n": n})));
    }
    assert!(bridge.pending().is_empty());
}

#[tokio::test]
async fn duplicate_id_is_rejected_without_disturbing_the_first() {
    let (bridge, mut worker) = connect(config()).await;

    let first = spawn_dispatch(&bridge, Request::call(7, "slow", None), None);
    assert_eq!(worker.next_message().await["id"], 7);

    let second = bridge
        .multiplexer()
        .try_dispatch(Request::call(7, "slow", None), None, None)
        .await;
    assert_eq!(second, Err(BridgeError::DuplicateRequestId(Id::Number(7))));

    worker
        .reply(json!({"jsonrpc":"2.0","id":7,"result":"done"}))
        .await;
    let first = first.await.unwrap();
    assert_eq!(first.response.result, Some(json!("done")));
}

#[tokio::test]
async fn duplicate_id_leaves_the_first_sink_and_sessions_alone() {
    let (bridge, mut worker) = connect(config()).await;
    let (first_sink, mut first_frames) = ChannelSink::raw();

    let multiplexer = bridge.multiplexer().clone();
    let first = tokio::spawn(async move {
        multiplexer
            .dispatch(Request::call(7, "slow", None), Some("s"), Some(first_sink))
            .await
    });
    assert_eq!(worker.next_message().await["id"], 7);
    assert_eq!(bridge.sessions().len(), 1);

    let (second_sink, _second_frames) = ChannelSink::raw();
    let same_session = bridge
        .multiplexer()
        .try_dispatch(Request::call(7, "slow", None), Some("s"), Some(second_sink.clone()))
        .await;
    assert_eq!(same_session, Err(BridgeError::DuplicateRequestId(Id::Number(7))));

    let no_session = bridge
        .multiplexer()
        .dispatch(Request::call(7, "slow", None), None, None)
        .await;
    assert_eq!(no_session.session_id, None);
    assert_eq!(error_kind(&no_session.response), "duplicate_request_id");

    assert_eq!(bridge.sessions().len(), 1);
    assert!(!second_sink.is_closed());
    assert!(bridge.sessions().sink("s").is_some_and(|sink| !sink.is_closed()));

    worker
        .reply(json!({"jsonrpc":"2.0","id":7,"result":"done"}))
        .await;
    assert_eq!(first.await.unwrap().response.result, Some(json!("done")));
    let pushed: Value = serde_json::from_str(&first_frames.recv().await.unwrap()).unwrap();
    assert_eq!(pushed, json!({"jsonrpc":"2.0","id":7,"result":"done"}));
}

#[tokio::test(start_paused = true)]
async fn timed_out_id_is_released_for_reuse() {
    let (bridge, mut worker) = connect(BridgeConfig {
        request_timeout_ms: 100,
        ..config()
    })
    .await;

    let waiting = bridge.multiplexer().clone();
    let timed_out = tokio::spawn(async move {
        waiting
            .try_dispatch(Request::call(1, "hang", None), None, None)
            .await
    });
    assert_eq!(worker.next_message().await["method"], "hang");

    assert_eq!(
        timed_out.await.unwrap(),
        Err(BridgeError::RequestTimeout {
            id: Id::Number(1),
            timeout_ms: 100
        })
    );
    assert!(bridge.pending().is_empty());

    let retry = spawn_dispatch(&bridge, Request::call(1, "hang", None), None);
    assert_eq!(worker.next_message().await["id"], 1);
    worker
        .reply(json!({"jsonrpc":"2.0","id":1,"result":true}))
        .await;
    assert_eq!(retry.await.unwrap().response.result, Some(json!(true)));
}

#[tokio::test]
async fn split_and_coalesced_lines_are_framed() {
    let (bridge, mut worker) = connect(config()).await;

    let a = spawn_dispatch(&bridge, Request::call(1, "a", None), None);
    let b = spawn_dispatch(&bridge, Request::call(2, "b", None), None);
    let c = spawn_dispatch(&bridge, Request::call(3, "c", None), None);
    for _ in 0..3 {
        worker.next_message().await;
    }

    let line = r#"{"jsonrpc":"2.0","id":1,"result":{"text":"split"}}"#;
    let (head, tail) = line.split_at(20);
    worker.write_raw(head.as_bytes()).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    worker.write_raw(format!("{tail}\n").as_bytes()).await;

    worker
        .write_raw(
            b"{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":2}\n{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":3}\n",
        )
        .await;

    assert_eq!(
        a.await.unwrap().response.result,
        Some(json!({"text": "split"}))
    );
    assert_eq!(b.await.unwrap().response.result, Some(json!(2)));
    assert_eq!(c.await.unwrap().response.result, Some(json!(3)));
}

#[tokio::test]
async fn garbage_from_the_worker_is_dropped() {
    let (bridge, mut worker) = connect(config()).await;

    let call = spawn_dispatch(&bridge, Request::call(9, "ping", None), None);
    worker.next_message().await;
    worker.write_raw(b"starting up...\n").await;
    worker
        .reply(json!({"jsonrpc":"2.0","id":"unknown","result":null}))
        .await;
    worker
        .reply(json!({"jsonrpc":"2.0","id":9,"result":null}))
        .await;

    let response = call.await.unwrap().response;
    assert_eq!(response.id, Id::Number(9));
    assert_eq!(response.result, Some(Value::Null));
    assert!(bridge.is_ready());
}

#[tokio::test]
async fn worker_exit_fails_pending_requests() {
    let (bridge, mut worker) = connect(config()).await;

    let a = spawn_dispatch(&bridge, Request::call(1, "a", None), None);
    let b = spawn_dispatch(&bridge, Request::call(2, "b", None), None);
    worker.next_message().await;
    worker.next_message().await;
    assert_eq!(bridge.health().pending, 2);

    drop(worker);

    for call in [a, b] {
        let response = call.await.unwrap().response;
        assert_eq!(response.error.as_ref().unwrap().code, -32603);
        assert_eq!(error_kind(&response), "worker_unavailable");
    }
    assert!(!bridge.is_ready());
    assert_eq!(bridge.worker_state(), WorkerState::Crashed);
    assert_eq!(bridge.health().status, "degraded");
    assert_eq!(bridge.status().status, WorkerState::Crashed);

    let after = bridge
        .multiplexer()
        .try_dispatch(Request::call(3, "c", None), None, None)
        .await;
    assert!(matches!(after, Err(BridgeError::WorkerUnavailable(_))));
    assert!(bridge.pending().is_empty());
}

#[tokio::test]
async fn responses_are_pushed_to_the_session_sink() {
    let (bridge, mut worker) = connect(config()).await;
    let (sink, mut frames) = ChannelSink::raw();

    let multiplexer = bridge.multiplexer().clone();
    let call = tokio::spawn(async move {
        multiplexer
            .dispatch(Request::call(4, "tools/list", None), Some("client-a"), Some(sink))
            .await
    });
    worker.next_message().await;
    worker
        .reply(json!({"jsonrpc":"2.0","id":4,"result":{"tools":[]}}))
        .await;

    let dispatched = call.await.unwrap();
    assert_eq!(dispatched.session_id.as_deref(), Some("client-a"));
    let pushed: Value = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
    assert_eq!(pushed, json!({"jsonrpc":"2.0","id":4,"result":{"tools":[]}}));
}

#[tokio::test]
async fn event_stream_announces_and_receives_responses() {
    let (bridge, mut worker) = connect(config()).await;
    let mut stream = bridge.open_event_stream(None, "/messages").unwrap();
    let session = stream.session_id.clone();

    assert_eq!(
        stream.frames.recv().await.unwrap(),
        format!("event: endpoint\ndata: /messages?sessionId={session}\n\n")
    );
    let connection = stream.frames.recv().await.unwrap();
    assert!(connection.contains(r#""type":"connection""#));

    let call = spawn_dispatch(&bridge, Request::call(11, "ping", None), Some(session.as_str()));
    worker.next_message().await;
    worker
        .reply(json!({"jsonrpc":"2.0","id":11,"result":{}}))
        .await;
    call.await.unwrap();

    assert_eq!(
        stream.frames.recv().await.unwrap(),
        "data: {\"jsonrpc\":\"2.0\",\"result\":{},\"id\":11}\n\n"
    );

    bridge.shutdown();
    assert!(bridge.sessions().is_empty());
    assert!(stream.sink.is_closed());
}

#[tokio::test]
async fn unknown_sessions_can_be_rejected() {
    let (bridge, _worker) = connect(BridgeConfig {
        reject_unknown_sessions: true,
        ..config()
    })
    .await;

    let dispatched = bridge
        .multiplexer()
        .dispatch(Request::call(1, "ping", None), Some("nope"), None)
        .await;
    assert_eq!(dispatched.session_id, None);
    let error = dispatched.response.error.as_ref().unwrap();
    assert_eq!(error.code, -32000);
    assert_eq!(error.message, "Invalid or missing session ID: nope");
    assert!(bridge.pending().is_empty());
}

#[tokio::test]
async fn requests_without_id_and_notifications() {
    let (bridge, mut worker) = connect(config()).await;

    let dispatched = bridge
        .multiplexer()
        .dispatch(Request::notification("ping", None), None, None)
        .await;
    assert_eq!(dispatched.response.id, Id::Null);
    assert_eq!(dispatched.response.error.as_ref().unwrap().code, -32600);

    bridge
        .multiplexer()
        .notify(Request::notification(
            "notifications/initialized",
            None,
        ))
        .unwrap();
    assert_eq!(
        worker.next_message().await,
        json!({"jsonrpc":"2.0","method":"notifications/initialized"})
    );
    assert!(bridge.pending().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn spawned_workers_report_their_lifecycle() {
    let cat = Bridge::start(BridgeConfig {
        worker_command: Some("cat".to_string()),
        handshake_delay_ms: 10,
        ..BridgeConfig::default()
    })
    .unwrap();
    cat.wait_until_ready().await.unwrap();
    assert_eq!(cat.status().status, WorkerState::Ready);
    cat.shutdown();
    assert!(!cat.is_ready());

    let exits = Bridge::start(BridgeConfig {
        worker_command: Some("true".to_string()),
        handshake_delay_ms: 500,
        ..BridgeConfig::default()
    })
    .unwrap();
    assert!(exits.wait_until_ready().await.is_err());
    assert_eq!(exits.worker_state(), WorkerState::Crashed);

    let missing = Bridge::start(BridgeConfig::default());
    assert!(missing.is_err());
}
