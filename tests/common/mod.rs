//! Shared utilities for broker integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query},
    http::{header::CONTENT_TYPE, HeaderMap},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use tunnel_broker::client::SharedRuleset;
use tunnel_broker::filters::{BodyPredicate, FilterRule, Ruleset};
use tunnel_broker::protocol::{decode_binary, encode, Frame, WireMessage};
use tunnel_broker::{BrokerClient, BrokerConfig, BrokerServer, ConnectionRegistry, Shutdown};

pub const TOKEN: &str = "12345";
pub const AUTH_HEADER: &str = "X-Broker-Authorization";

pub type RawTunnel = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn echo_body(headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    ([(CONTENT_TYPE, content_type)], body)
}

async fn echo_param(Path(param): Path<String>) -> String {
    param
}

async fn echo_headers(headers: HeaderMap) -> Json<HashMap<String, String>> {
    Json(
        headers
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect(),
    )
}

async fn echo_query(Query(query): Query<HashMap<String, String>>) -> Json<HashMap<String, String>> {
    Json(query)
}

/// Start the stand-in private service on an ephemeral port.
pub async fn start_origin() -> SocketAddr {
    let app = Router::new()
        .route("/echo-body", post(echo_body))
        .route("/echo-body/{*rest}", post(echo_body))
        .route("/echo-param/{param}", get(echo_param))
        .route("/echo-headers", post(echo_headers).get(echo_headers))
        .route("/echo-query", get(echo_query));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Client whitelist used by most tests.
pub fn client_rules() -> Ruleset {
    Ruleset::new(vec![
        FilterRule {
            method: "post".into(),
            path: "/echo-body/filtered".into(),
            origin: None,
            valid: vec![BodyPredicate {
                path: "proxy.me".into(),
                value: serde_json::json!("please"),
            }],
        },
        rule("post", "/echo-body"),
        FilterRule {
            method: "get".into(),
            path: "/echo-param/:param".into(),
            origin: Some("http://127.0.0.1:${ORIGIN_PORT}".into()),
            valid: vec![],
        },
        rule("any", "/echo-headers"),
        rule("get", "/echo-query"),
    ])
}

pub fn rule(method: &str, path: &str) -> FilterRule {
    FilterRule {
        method: method.into(),
        path: path.into(),
        origin: None,
        valid: vec![],
    }
}

/// A running broker server.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<ConnectionRegistry>,
    pub shutdown: Arc<Shutdown>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn tunnel_url(&self) -> String {
        format!("ws://{}/tunnel", self.addr)
    }
}

pub fn server_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.server.bind_address = "127.0.0.1:0".into();
    config
}

pub async fn start_server(config: BrokerConfig, filters: Option<Ruleset>) -> TestServer {
    let server = BrokerServer::new(&config, filters).unwrap();
    let registry = server.registry();
    let shutdown = Arc::new(Shutdown::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        server.run(listener, rx).await.unwrap();
    });

    TestServer {
        addr,
        registry,
        shutdown,
    }
}

pub fn client_config(server: SocketAddr, origin: SocketAddr) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.client.server_url = format!("http://{server}");
    config.client.token = TOKEN.into();
    config.client.origin = format!("http://{origin}");
    config.client.dispatch_timeout_secs = 5;
    config.client.reconnect_base_delay_ms = 20;
    config.client.reconnect_max_delay_ms = 200;
    config
}

/// Variables the client substitutes from.
pub fn client_vars(origin: SocketAddr) -> HashMap<String, String> {
    HashMap::from([
        ("BROKER_TYPE".to_string(), "client".to_string()),
        ("BROKER_TOKEN".to_string(), TOKEN.to_string()),
        ("ORIGIN_PORT".to_string(), origin.port().to_string()),
    ])
}

/// Start a client and return the handle to its live ruleset.
pub fn start_client(config: &BrokerConfig, rules: Ruleset, origin: SocketAddr, shutdown: &Shutdown) -> SharedRuleset {
    let client = BrokerClient::new(config, rules).with_variables(Arc::new(client_vars(origin)));
    let filters = client.filters();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        client.run(rx).await.unwrap();
    });
    filters
}

/// Wait until `token` has a live channel.
pub async fn wait_for_token(registry: &ConnectionRegistry, token: &str) {
    for _ in 0..250 {
        if registry.has(token) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("token {token} never registered");
}

/// Origin, server and client wired together with the default rules.
pub struct Stack {
    pub server: TestServer,
    pub origin: SocketAddr,
    pub filters: SharedRuleset,
}

pub async fn start_stack() -> Stack {
    start_stack_with(server_config(), None).await
}

pub async fn start_stack_with(config: BrokerConfig, server_filters: Option<Ruleset>) -> Stack {
    let origin = start_origin().await;
    let server = start_server(config, server_filters).await;
    let filters = start_client(&client_config(server.addr, origin), client_rules(), origin, &server.shutdown);
    wait_for_token(&server.registry, TOKEN).await;
    Stack {
        server,
        origin,
        filters,
    }
}

/// Open a tunnel by hand and identify with `token`.
pub async fn connect_raw(server: &TestServer, token: &str) -> RawTunnel {
    let (mut ws, _) = tokio_tungstenite::connect_async(server.tunnel_url()).await.unwrap();
    ws.send(Message::Text(token.to_string().into())).await.unwrap();
    wait_for_token(&server.registry, token).await;
    ws
}

/// Next protocol frame from the server, `None` once the tunnel closes.
pub async fn next_frame(ws: &mut RawTunnel) -> Option<Frame> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Binary(data)) => return Some(decode_binary(data).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

/// Read frames until a request has fully arrived. Returns its RequestHead frame.
pub async fn next_request(ws: &mut RawTunnel) -> Frame {
    let head = next_frame(ws).await.expect("request head");
    assert!(matches!(head, Frame::RequestHead { .. }), "expected request head, got {head:?}");
    loop {
        match next_frame(ws).await.expect("request frames") {
            Frame::End { .. } => return head,
            Frame::Chunk { .. } => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

pub async fn send_frame(ws: &mut RawTunnel, frame: Frame) {
    let WireMessage::Binary(data) = encode(&frame).unwrap() else {
        panic!("relay frames are binary");
    };
    ws.send(Message::Binary(data)).await.unwrap();
}
