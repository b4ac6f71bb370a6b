//! Relay integration tests
//!
//! Runs a real relay on an ephemeral port and drives it with a scripted
//! tunnel client speaking the frame protocol over tokio-tungstenite.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use bt_core::config::RelayConfig;
use bt_core::ClientId;
use bt_protocol::{decode_frame, encode_frame, Frame, RequestEnvelope, ResponseEnvelope};
use bt_relay::{RelayServer, RelayState};

struct TestRelay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    cancel: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestRelay {
    async fn start(mut config: RelayConfig) -> Self {
        config.bind_address = "127.0.0.1:0".to_string();
        let cancel = CancellationToken::new();
        let state = Arc::new(RelayState::with_shutdown(config, cancel.clone()));
        let server = RelayServer::bind(Arc::clone(&state))
            .await
            .expect("Failed to bind relay");
        let addr = server.local_addr().expect("No local address");
        let handle = tokio::spawn(server.run());

        Self {
            addr,
            state,
            cancel,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Wait until `client_id` has a session other than `previous`
    async fn wait_registered(&self, client_id: &str, previous: Option<u64>) -> u64 {
        let id = ClientId::from(client_id);
        for _ in 0..200 {
            if let Some(record) = self.state.registry.lookup(&id) {
                if Some(record.connection_id) != previous {
                    return record.connection_id;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never registered", client_id);
    }

    async fn wait_unregistered(&self, client_id: &str) {
        let id = ClientId::from(client_id);
        for _ in 0..200 {
            if self.state.registry.lookup(&id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never unregistered", client_id);
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = timeout(Duration::from_secs(5), self.handle).await;
    }
}

/// Scripted tunnel client
struct FakeClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl FakeClient {
    async fn connect(relay: &TestRelay, path_id: &str, announced_id: &str) -> Self {
        let (mut ws, _) = connect_async(format!("ws://{}/{}", relay.addr, path_id))
            .await
            .expect("Failed to open control connection");

        let register = encode_frame(Frame::Register {
            client_id: announced_id.to_string(),
        })
        .unwrap();
        ws.send(Message::Binary(register.to_vec())).await.unwrap();

        Self { ws }
    }

    async fn register(relay: &TestRelay, client_id: &str) -> (Self, u64) {
        Self::register_replacing(relay, client_id, None).await
    }

    async fn register_replacing(
        relay: &TestRelay,
        client_id: &str,
        previous: Option<u64>,
    ) -> (Self, u64) {
        let client = Self::connect(relay, client_id, client_id).await;
        let connection_id = relay.wait_registered(client_id, previous).await;
        (client, connection_id)
    }

    async fn next_request(&mut self) -> RequestEnvelope {
        loop {
            let message = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("Timed out waiting for a request")
                .expect("Control connection closed")
                .expect("Control connection failed");

            match message {
                Message::Binary(data) => match decode_frame(&data).unwrap() {
                    Frame::Request(request) => return request,
                    other => panic!("Unexpected frame {:?}", other),
                },
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("Unexpected message {:?}", other),
            }
        }
    }

    async fn respond(&mut self, response: ResponseEnvelope) {
        let bytes = encode_frame(Frame::Response(response)).unwrap();
        self.ws.send(Message::Binary(bytes.to_vec())).await.unwrap();
    }

    async fn send_raw(&mut self, data: Vec<u8>) {
        self.ws.send(Message::Binary(data)).await.unwrap();
    }

    /// Whether the relay closes the connection within a few seconds
    async fn closed_by_relay(&mut self) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}

#[tokio::test]
async fn test_ping() {
    let relay = TestRelay::start(RelayConfig::default()).await;

    let response = reqwest::get(relay.url("/ping")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["message"], "pong");

    relay.stop().await;
}

#[tokio::test]
async fn test_absent_session_is_404() {
    let relay = TestRelay::start(RelayConfig::default()).await;

    for path in ["/nobody", "/nobody/", "/nobody/api/items"] {
        let response = reqwest::get(relay.url(path)).await.unwrap();
        assert_eq!(response.status(), 404, "path {}", path);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Tunnel not active");
    }

    relay.stop().await;
}

#[tokio::test]
async fn test_forwards_request_and_response() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let (mut client, _) = FakeClient::register(&relay, "c1").await;

    let url = relay.url("/c1/api/items?page=2");
    let caller = tokio::spawn(async move {
        reqwest::Client::new()
            .post(url)
            .header("X-Trace", "abc")
            .body("payload")
            .send()
            .await
            .unwrap()
    });

    let request = client.next_request().await;
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/api/items?page=2");
    assert_eq!(request.header("x-trace"), Some("abc"));
    assert!(request.header("host").is_none());
    assert_eq!(&request.body[..], b"payload");

    client
        .respond(
            ResponseEnvelope::new(request.correlation_id, 201)
                .with_header("Content-Type", "application/json")
                .with_header("Set-Cookie", "a=1")
                .with_header("Set-Cookie", "b=2")
                .with_body(r#"{"ok":true}"#),
        )
        .await;

    let response = caller.await.unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
    assert_eq!(response.text().await.unwrap(), r#"{"ok":true}"#);

    relay.stop().await;
}

#[tokio::test]
async fn test_root_path_is_forwarded_as_slash() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let (mut client, _) = FakeClient::register(&relay, "c1").await;

    let url = relay.url("/c1");
    let caller = tokio::spawn(async move { reqwest::get(url).await.unwrap() });

    let request = client.next_request().await;
    assert_eq!(request.method, "GET");
    assert_eq!(request.path, "/");
    client
        .respond(ResponseEnvelope::new(request.correlation_id, 200).with_body("root"))
        .await;

    let response = caller.await.unwrap();
    assert_eq!(response.text().await.unwrap(), "root");

    relay.stop().await;
}

#[tokio::test]
async fn test_concurrent_responses_out_of_order() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let (mut client, _) = FakeClient::register(&relay, "c1").await;

    let first_url = relay.url("/c1/first");
    let first = tokio::spawn(async move { reqwest::get(first_url).await.unwrap() });
    let a = client.next_request().await;

    let second_url = relay.url("/c1/second");
    let second = tokio::spawn(async move { reqwest::get(second_url).await.unwrap() });
    let b = client.next_request().await;

    assert_ne!(a.correlation_id, b.correlation_id);

    // Answer the later request first
    client
        .respond(ResponseEnvelope::new(b.correlation_id, 200).with_body(b.path.clone()))
        .await;
    client
        .respond(ResponseEnvelope::new(a.correlation_id, 200).with_body(a.path.clone()))
        .await;

    assert_eq!(first.await.unwrap().text().await.unwrap(), "/first");
    assert_eq!(second.await.unwrap().text().await.unwrap(), "/second");

    relay.stop().await;
}

#[tokio::test]
async fn test_timeout_returns_504_and_frees_slot() {
    let mut config = RelayConfig::default();
    config.request_timeout = Duration::from_millis(200);
    let relay = TestRelay::start(config).await;
    let (mut client, _) = FakeClient::register(&relay, "c1").await;

    let url = relay.url("/c1/slow");
    let caller = tokio::spawn(async move { reqwest::get(url).await.unwrap() });
    let request = client.next_request().await;

    let response = caller.await.unwrap();
    assert_eq!(response.status(), 504);

    let session = relay.state.registry.lookup(&ClientId::from("c1")).unwrap();
    assert!(!session.pending.contains(request.correlation_id));

    // A late answer is ignored and the session keeps working
    client
        .respond(ResponseEnvelope::new(request.correlation_id, 200))
        .await;

    let url = relay.url("/c1/fast");
    let caller = tokio::spawn(async move { reqwest::get(url).await.unwrap() });
    let request = client.next_request().await;
    client
        .respond(ResponseEnvelope::new(request.correlation_id, 200).with_body("ok"))
        .await;
    assert_eq!(caller.await.unwrap().text().await.unwrap(), "ok");

    relay.stop().await;
}

#[tokio::test]
async fn test_disconnect_fails_pending_with_502() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let (mut client, _) = FakeClient::register(&relay, "c1").await;

    let url = relay.url("/c1/hang");
    let caller = tokio::spawn(async move { reqwest::get(url).await.unwrap() });
    client.next_request().await;

    drop(client);

    let response = caller.await.unwrap();
    assert_eq!(response.status(), 502);
    relay.wait_unregistered("c1").await;

    let response = reqwest::get(relay.url("/c1/again")).await.unwrap();
    assert_eq!(response.status(), 404);

    relay.stop().await;
}

#[tokio::test]
async fn test_replacement_fails_old_pending_and_routes_to_new() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let (mut old, old_id) = FakeClient::register(&relay, "c1").await;

    let url = relay.url("/c1/pending");
    let caller = tokio::spawn(async move { reqwest::get(url).await.unwrap() });
    old.next_request().await;

    let (mut new, new_id) = FakeClient::register_replacing(&relay, "c1", Some(old_id)).await;
    assert_ne!(old_id, new_id);

    let response = caller.await.unwrap();
    assert_eq!(response.status(), 502);
    assert!(old.closed_by_relay().await);

    let url = relay.url("/c1/next");
    let caller = tokio::spawn(async move { reqwest::get(url).await.unwrap() });
    let request = new.next_request().await;
    new.respond(ResponseEnvelope::new(request.correlation_id, 200).with_body("new"))
        .await;
    assert_eq!(caller.await.unwrap().text().await.unwrap(), "new");

    // The old connection's teardown must not remove the new session
    assert_eq!(
        relay
            .state
            .registry
            .lookup(&ClientId::from("c1"))
            .unwrap()
            .connection_id,
        new_id
    );

    relay.stop().await;
}

#[tokio::test]
async fn test_pending_limit_returns_503() {
    let mut config = RelayConfig::default();
    config.max_pending_per_session = 1;
    let relay = TestRelay::start(config).await;
    let (mut client, _) = FakeClient::register(&relay, "c1").await;

    let url = relay.url("/c1/first");
    let first = tokio::spawn(async move { reqwest::get(url).await.unwrap() });
    let request = client.next_request().await;

    let response = reqwest::get(relay.url("/c1/second")).await.unwrap();
    assert_eq!(response.status(), 503);

    client
        .respond(ResponseEnvelope::new(request.correlation_id, 204))
        .await;
    assert_eq!(first.await.unwrap().status(), 204);

    relay.stop().await;
}

#[tokio::test]
async fn test_decode_fault_closes_session() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let (mut client, _) = FakeClient::register(&relay, "c1").await;

    client.send_raw(vec![0xde, 0xad, 0xbe, 0xef]).await;

    assert!(client.closed_by_relay().await);
    relay.wait_unregistered("c1").await;

    relay.stop().await;
}

#[tokio::test]
async fn test_mismatched_registration_is_rejected() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let mut client = FakeClient::connect(&relay, "c1", "c2").await;

    assert!(client.closed_by_relay().await);
    assert!(relay.state.registry.is_empty());

    relay.stop().await;
}

#[tokio::test]
async fn test_invalid_identifier_upgrade_is_rejected() {
    let relay = TestRelay::start(RelayConfig::default()).await;

    for path_id in ["a%20b", "x%41", "caf%C3%A9"] {
        let result = connect_async(format!("ws://{}/{}", relay.addr, path_id)).await;
        assert!(result.is_err(), "upgrade accepted on /{}", path_id);
    }
    assert!(relay.state.registry.is_empty());

    relay.stop().await;
}

#[tokio::test]
async fn test_root_and_subpath_resolve_the_same_identifier() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let (mut client, _) = FakeClient::register(&relay, "xA").await;

    // Percent-encoded spellings of the id match no session on either route
    for path in ["/x%41", "/x%41/", "/x%41/deep"] {
        let response = reqwest::get(relay.url(path)).await.unwrap();
        assert_eq!(response.status(), 404, "path {}", path);
    }

    for (path, forwarded) in [("/xA", "/"), ("/xA/deep", "/deep")] {
        let url = relay.url(path);
        let caller = tokio::spawn(async move { reqwest::get(url).await.unwrap() });

        let request = client.next_request().await;
        assert_eq!(request.path, forwarded);
        client
            .respond(ResponseEnvelope::new(request.correlation_id, 204))
            .await;

        assert_eq!(caller.await.unwrap().status(), 204);
    }

    relay.stop().await;
}

#[tokio::test]
async fn test_shutdown_tears_down_sessions() {
    let relay = TestRelay::start(RelayConfig::default()).await;
    let (mut client, _) = FakeClient::register(&relay, "c1").await;

    let state = Arc::clone(&relay.state);
    relay.stop().await;

    assert!(client.closed_by_relay().await);
    assert!(state.registry.is_empty());
}
