//! Integration tests: drive a thread session against an in-memory socket.
//!
//! Each connect attempt is handed to the test, which accepts it (and then
//! plays the server) or rejects it. Time is paused, so backoff, debounce and
//! typing deadlines are checked against exact virtual instants.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep, timeout};
use url::Url;

use threadline_sync::backoff::ConnectionState;
use threadline_sync::session::{AUTH_REJECTED, CONNECTION_LOST};
use threadline_sync::{
    ChatClient, CloseInfo, Connector, Identity, Result, SessionHandle, SocketEvent, SocketPair,
    SyncConfig, SyncError, ThreadApi, ThreadSession, ThreadView,
};
use threadline_types::api::{Claims, ThreadResponse};
use threadline_types::models::Message;

const ME: &str = "me";

struct Dial {
    url: Url,
    respond: oneshot::Sender<Result<SocketPair>>,
}

impl Dial {
    fn accept(self) -> Server {
        let (outbound, sent) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        let _ = self.respond.send(Ok(SocketPair { outbound, inbound }));
        Server { sent, events }
    }

    fn reject(self, err: SyncError) {
        let _ = self.respond.send(Err(err));
    }
}

/// The server end of an accepted socket.
struct Server {
    sent: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl Server {
    fn push(&self, frame: Value) {
        self.events.send(SocketEvent::Text(frame.to_string())).unwrap();
    }

    fn push_raw(&self, raw: &str) {
        self.events.send(SocketEvent::Text(raw.to_string())).unwrap();
    }

    fn close(&self, close: Option<CloseInfo>) {
        self.events.send(SocketEvent::Closed(close)).unwrap();
    }

    async fn next_sent(&mut self) -> Value {
        let raw = self.sent.recv().await.expect("socket closed");
        serde_json::from_str(&raw).unwrap()
    }
}

#[derive(Clone)]
struct MemoryConnector {
    dials: mpsc::UnboundedSender<Dial>,
}

impl Connector for MemoryConnector {
    async fn connect(&self, url: Url) -> Result<SocketPair> {
        let (respond, rx) = oneshot::channel();
        self.dials
            .send(Dial { url, respond })
            .map_err(|_| SyncError::Connection("harness gone".into()))?;
        rx.await
            .map_err(|_| SyncError::Connection("dial dropped".into()))?
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("threadline_sync=debug")
        .with_test_writer()
        .try_init();
}

fn message(id: i64, sender: &str, minute: u32) -> Value {
    json!({
        "id": id,
        "sender": sender,
        "content": format!("message {id}"),
        "created_at": format!("2024-03-01T10:{minute:02}:00Z"),
    })
}

fn message_frame(id: i64, sender: &str, minute: u32) -> Value {
    let mut frame = message(id, sender, minute);
    frame["type"] = json!("message");
    frame
}

fn thread(id: i64, history: &[(i64, &str, u32)]) -> ThreadResponse {
    ThreadResponse {
        id,
        title: Some("Pump offline".into()),
        status: Some("active".into()),
        priority: None,
        created_at: None,
        messages: history
            .iter()
            .map(|&(id, sender, minute)| serde_json::from_value::<Message>(message(id, sender, minute)).unwrap())
            .collect(),
        extra: Default::default(),
    }
}

fn open(seed: ThreadResponse) -> (SessionHandle, mpsc::UnboundedReceiver<Dial>) {
    init_tracing();
    let (dials_tx, dials) = mpsc::unbounded_channel();
    let session = ThreadSession::open(
        SyncConfig::default(),
        Arc::new(MemoryConnector { dials: dials_tx }),
        seed,
        "token",
        Identity::new(ME, false),
    )
    .unwrap();
    (session, dials)
}

async fn open_connected(seed: ThreadResponse) -> (SessionHandle, mpsc::UnboundedReceiver<Dial>, Server) {
    let (session, mut dials) = open(seed);
    let server = dials.recv().await.unwrap().accept();
    wait_for(&session, |v| v.state == ConnectionState::Open).await;
    (session, dials, server)
}

async fn wait_for(session: &SessionHandle, pred: impl FnMut(&Arc<ThreadView>) -> bool) -> Arc<ThreadView> {
    let mut view: watch::Receiver<Arc<ThreadView>> = session.view();
    let found = view.wait_for(pred).await.unwrap();
    found.clone()
}

/// Presence from a sentinel user, to know every earlier frame was handled.
async fn settle(session: &SessionHandle, server: &Server, marker: &str) -> Arc<ThreadView> {
    server.push(json!({"type": "presence", "user": marker, "online": true}));
    wait_for(session, |v| v.online.iter().any(|u| u == marker)).await
}

fn ids(view: &ThreadView) -> Vec<i64> {
    view.messages.iter().map(|m| m.id).collect()
}

#[tokio::test(start_paused = true)]
async fn test_timeline_is_ordered_and_deduplicated() {
    let (session, _dials, server) = open_connected(thread(1, &[(1, "bob", 0), (2, "bob", 1)])).await;

    server.push(message_frame(4, "bob", 4));
    server.push(message_frame(3, "alice", 3));
    server.push(message_frame(4, "bob", 4));
    server.push(message_frame(2, "bob", 1));
    let view = settle(&session, &server, "s").await;

    assert_eq!(ids(&view), vec![1, 2, 3, 4]);
    assert_eq!(view.unread, 4);
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_message_is_not_fanned_out() {
    let (session, _dials, server) = open_connected(thread(1, &[(1, "bob", 0)])).await;
    let mut frames = session.frames();

    server.push(message_frame(1, "bob", 0));
    server.push(message_frame(2, "bob", 2));
    server.push(message_frame(2, "bob", 2));
    let view = settle(&session, &server, "s").await;

    assert_eq!(ids(&view), vec![1, 2]);
    let mut delivered = Vec::new();
    while let Ok(frame) = frames.try_recv() {
        delivered.push(frame.kind());
    }
    assert_eq!(delivered, vec!["message", "presence"]);
}

#[tokio::test(start_paused = true)]
async fn test_read_frames_are_idempotent() {
    let (session, _dials, server) = open_connected(thread(1, &[(1, "bob", 0)])).await;

    let read = json!({
        "type": "read", "message_id": 1, "user": "alice",
        "timestamp": "2024-03-01T10:05:00Z", "read_count": 1,
    });
    server.push(read.clone());
    server.push(read);
    let view = settle(&session, &server, "s").await;

    let msg = &view.messages[0];
    assert!(msg.is_read_by("alice"));
    assert_eq!(msg.read_receipts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_dropped() {
    let (session, _dials, server) = open_connected(thread(1, &[])).await;

    server.push_raw("not json");
    server.push(json!({"type": "bogus"}));
    server.push(message_frame(7, "bob", 2));
    let view = settle(&session, &server, "s").await;

    assert_eq!(ids(&view), vec![7]);
    assert_eq!(view.state, ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_then_failed() {
    let (session, mut dials, server) = open_connected(thread(1, &[])).await;

    server.close(None);
    for expected in [1000, 2000, 4000, 8000, 10000] {
        let t0 = Instant::now();
        let dial = dials.recv().await.unwrap();
        assert_eq!(t0.elapsed(), Duration::from_millis(expected));
        dial.reject(SyncError::Connection("refused".into()));
    }

    let view = wait_for(&session, |v| v.state == ConnectionState::Failed).await;
    assert_eq!(view.error.as_deref(), Some(CONNECTION_LOST));
    assert!(timeout(Duration::from_secs(60), dials.recv()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_open_resets_retry_counter() {
    let (session, mut dials, server) = open_connected(thread(1, &[])).await;

    server.close(None);
    dials.recv().await.unwrap().reject(SyncError::Connection("refused".into()));
    let t0 = Instant::now();
    let server = dials.recv().await.unwrap().accept();
    assert_eq!(t0.elapsed(), Duration::from_millis(2000));
    wait_for(&session, |v| v.state == ConnectionState::Open).await;

    server.close(None);
    wait_for(&session, |v| v.state == ConnectionState::WaitingToRetry).await;
    let t0 = Instant::now();
    dials.recv().await.unwrap();
    assert_eq!(t0.elapsed(), Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn test_auth_close_fails_without_retry() {
    let (session, mut dials, server) = open_connected(thread(1, &[])).await;

    server.close(Some(CloseInfo { code: 4401, reason: "bad token".into() }));
    let view = wait_for(&session, |v| v.state == ConnectionState::Failed).await;

    assert_eq!(view.error.as_deref(), Some(AUTH_REJECTED));
    assert!(timeout(Duration::from_secs(60), dials.recv()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_failure() {
    let (session, mut dials) = open(thread(1, &[]));
    dials.recv().await.unwrap().reject(SyncError::Auth("handshake rejected with 403".into()));
    wait_for(&session, |v| v.state == ConnectionState::Failed).await;

    session.reconnect().unwrap();
    let dial = dials.recv().await.unwrap();
    assert_eq!(dial.url.as_str(), "ws://localhost:8000/ws/chat/1/?token=token");
    let _server = dial.accept();

    let view = wait_for(&session, |v| v.state == ConnectionState::Open).await;
    assert!(view.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_send_requires_open_socket() {
    let (session, mut dials) = open(thread(1, &[]));

    let err = session.send_text("too early").await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidSend { state: ConnectionState::Connecting }));

    let mut server = dials.recv().await.unwrap().accept();
    wait_for(&session, |v| v.state == ConnectionState::Open).await;

    session.send_text("hello").await.unwrap();
    assert_eq!(server.next_sent().await, json!({"type": "message", "content": "hello"}));

    let mut fields = serde_json::Map::new();
    fields.insert("pressure".into(), json!(42));
    session.send_structured(fields).await.unwrap();
    assert_eq!(
        server.next_sent().await,
        json!({"type": "message", "structured": {"pressure": 42}})
    );

    assert!(session.notify_typing().await.unwrap());
    assert_eq!(server.next_sent().await, json!({"type": "typing"}));
}

#[tokio::test(start_paused = true)]
async fn test_blank_messages_are_rejected() {
    let (session, _dials, mut server) = open_connected(thread(1, &[])).await;

    assert!(matches!(session.send_text("").await, Err(SyncError::EmptyMessage)));
    assert!(matches!(session.send_text("  \n\t").await, Err(SyncError::EmptyMessage)));
    assert!(matches!(
        session.send_structured(serde_json::Map::new()).await,
        Err(SyncError::EmptyMessage)
    ));

    session.send_text(" ok ").await.unwrap();
    assert_eq!(server.next_sent().await, json!({"type": "message", "content": " ok "}));
}

#[tokio::test(start_paused = true)]
async fn test_visible_burst_sends_one_batch() {
    let (session, _dials, mut server) = open_connected(thread(1, &[(1, "bob", 0)])).await;
    for id in 10..15 {
        server.push(message_frame(id, "bob", 10 + id as u32));
    }
    server.push(message_frame(15, ME, 30));
    settle(&session, &server, "s").await;

    session.element_became_visible(1).unwrap();
    session.element_became_visible(15).unwrap();
    for id in 10..15 {
        session.element_became_visible(id).unwrap();
        sleep(Duration::from_millis(20)).await;
    }
    let last_signal = Instant::now() - Duration::from_millis(20);

    let mut read = Vec::new();
    for _ in 10..15 {
        let frame = server.next_sent().await;
        assert_eq!(frame["type"], "read");
        read.push(frame["message_id"].as_i64().unwrap());
    }
    assert_eq!(last_signal.elapsed(), Duration::from_millis(300));
    assert_eq!(read, vec![10, 11, 12, 13, 14]);
    assert!(timeout(Duration::from_secs(5), server.sent.recv()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_returning_page_flushes_immediately() {
    let (session, _dials, mut server) = open_connected(thread(1, &[])).await;
    server.push(message_frame(10, "bob", 10));
    settle(&session, &server, "s").await;

    session.element_became_visible(10).unwrap();
    session.page_visibility_changed(false).unwrap();
    let t0 = Instant::now();
    session.page_visibility_changed(true).unwrap();

    assert_eq!(server.next_sent().await, json!({"type": "read", "message_id": 10}));
    assert!(t0.elapsed() < Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_echoed_own_read_cancels_pending_receipt() {
    let (session, _dials, mut server) = open_connected(thread(1, &[])).await;
    server.push(message_frame(10, "bob", 10));
    settle(&session, &server, "s").await;

    session.element_became_visible(10).unwrap();
    server.push(json!({"type": "read", "message_id": 10, "user": ME}));
    let view = settle(&session, &server, "s2").await;

    assert_eq!(view.pending_reads, 0);
    assert_eq!(view.unread, 0);
    assert!(timeout(Duration::from_secs(1), server.sent.recv()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_pending_reads_survive_reconnect() {
    let (session, mut dials, server) = open_connected(thread(1, &[])).await;
    server.push(message_frame(10, "bob", 10));
    settle(&session, &server, "s").await;

    session.element_became_visible(10).unwrap();
    server.close(None);
    wait_for(&session, |v| v.state == ConnectionState::WaitingToRetry).await;
    sleep(Duration::from_millis(400)).await;
    assert_eq!(session.current().pending_reads, 1);

    let mut server = dials.recv().await.unwrap().accept();
    assert_eq!(server.next_sent().await, json!({"type": "read", "message_id": 10}));
    wait_for(&session, |v| v.pending_reads == 0).await;
}

#[tokio::test(start_paused = true)]
async fn test_typing_expires_after_ttl() {
    let (session, _dials, server) = open_connected(thread(1, &[])).await;

    server.push(json!({"type": "typing", "user": "bob"}));
    wait_for(&session, |v| v.typing == ["bob"]).await;
    let t0 = Instant::now();

    sleep(Duration::from_millis(2000)).await;
    server.push(json!({"type": "typing", "user": "bob"}));
    settle(&session, &server, "s").await;

    wait_for(&session, |v| v.typing.is_empty()).await;
    assert_eq!(t0.elapsed(), Duration::from_millis(5000));
}

#[tokio::test(start_paused = true)]
async fn test_presence_updates_online_set() {
    let (session, _dials, server) = open_connected(thread(1, &[])).await;

    server.push(json!({"type": "presence", "user": "bob", "online": true}));
    server.push(json!({"type": "presence", "user": "carol", "online": true}));
    server.push(json!({"type": "presence", "user": "bob", "online": false}));
    let view = settle(&session, &server, "s").await;

    assert_eq!(view.online, vec!["carol".to_string(), "s".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_all_read_marks_history() {
    let (session, _dials, mut server) = open_connected(thread(1, &[(1, "bob", 0), (2, ME, 1)])).await;
    server.push(message_frame(3, "bob", 3));
    settle(&session, &server, "s").await;
    session.element_became_visible(3).unwrap();

    assert_eq!(session.reconcile_all_read().await.unwrap(), 2);

    let view = session.current();
    assert_eq!(view.unread, 0);
    assert_eq!(view.pending_reads, 0);
    assert_eq!(server.next_sent().await["message_id"], 1);
    assert_eq!(server.next_sent().await["message_id"], 3);
}

#[tokio::test(start_paused = true)]
async fn test_close_flushes_and_releases_socket() {
    let (session, mut dials, mut server) = open_connected(thread(1, &[])).await;
    server.push(message_frame(10, "bob", 10));
    settle(&session, &server, "s").await;
    session.element_became_visible(10).unwrap();

    let mut view = session.view();
    session.close().await;

    assert_eq!(server.next_sent().await, json!({"type": "read", "message_id": 10}));
    assert!(server.sent.recv().await.is_none());
    assert_eq!(view.borrow_and_update().state, ConnectionState::Closed);
    assert!(dials.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_inbound_frames_fan_out() {
    let (session, _dials, server) = open_connected(thread(1, &[])).await;
    let mut frames = session.frames();

    server.push(json!({"type": "confirmation", "status": "sent", "message_id": 9}));
    let frame = frames.recv().await.unwrap();
    assert_eq!(frame.kind(), "confirmation");
}

#[tokio::test(start_paused = true)]
async fn test_client_switches_threads() {
    init_tracing();
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &Claims { username: ME.into(), is_staff: false, is_superuser: false, exp: None },
        &jsonwebtoken::EncodingKey::from_secret(b"test"),
    )
    .unwrap();
    let (dials_tx, mut dials) = mpsc::unbounded_channel();
    let mut client = ChatClient::new(SyncConfig::default(), MemoryConnector { dials: dials_tx }, token).unwrap();
    assert_eq!(client.identity().username, ME);

    client.attach(thread(1, &[])).await.unwrap();
    let mut first = dials.recv().await.unwrap().accept();
    wait_for(client.active().unwrap(), |v| v.state == ConnectionState::Open).await;

    client.attach(thread(2, &[])).await.unwrap();
    assert!(first.sent.recv().await.is_none());
    let dial = dials.recv().await.unwrap();
    assert_eq!(dial.url.path(), "/ws/chat/2/");
    assert_eq!(client.active().unwrap().thread_id(), 2);
}

/// One-shot HTTP responder for the REST half of mark-all-read.
async fn rest_stub(status: u16) -> (SyncConfig, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (head_tx, head) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut len = 0;
        while !buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf[len..]).await.unwrap();
            if n == 0 {
                break;
            }
            len += n;
        }
        let _ = head_tx.send(String::from_utf8_lossy(&buf[..len]).into_owned());
        let response = format!(
            "HTTP/1.1 {status} Stub\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}"
        );
        stream.write_all(response.as_bytes()).await.unwrap();
    });
    let config = SyncConfig {
        api_base: Url::parse(&format!("http://{addr}/api")).unwrap(),
        rest_retries: 0,
        ..SyncConfig::default()
    };
    (config, head)
}

fn rest_api(config: &SyncConfig) -> ThreadApi {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    ThreadApi::with_client(client, config, &Identity::new(ME, false), "token")
}

#[tokio::test]
async fn test_mark_all_read_calls_rest_then_reconciles() {
    let (session, _dials, mut server) = open_connected(thread(1, &[(1, "bob", 0), (2, "bob", 1)])).await;
    let (config, head) = rest_stub(200).await;

    assert_eq!(session.mark_all_read(&rest_api(&config)).await.unwrap(), 2);

    assert!(head.await.unwrap().starts_with("POST /api/tenant/threads/1/mark-all-read/ HTTP/1.1"));
    assert_eq!(session.current().unread, 0);
    assert_eq!(server.next_sent().await["message_id"], 1);
    assert_eq!(server.next_sent().await["message_id"], 2);
}

#[tokio::test]
async fn test_failed_mark_all_read_leaves_state_alone() {
    let (session, _dials, _server) = open_connected(thread(1, &[(1, "bob", 0)])).await;
    let (config, _head) = rest_stub(401).await;

    let err = session.mark_all_read(&rest_api(&config)).await.unwrap_err();

    assert!(err.is_auth());
    assert_eq!(session.current().unread, 1);
}
