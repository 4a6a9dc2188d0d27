//! Failure injection: stalled, vanishing and duplicate tunnels.

use std::time::Duration;

use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::SinkExt;
use tokio_tungstenite::tungstenite::Message;

use tunnel_broker::protocol::{Frame, ResponseHead};

mod common;
use common::{AUTH_HEADER, TOKEN};

fn spawn_get(url: String, token: &'static str) -> tokio::task::JoinHandle<reqwest::Response> {
    tokio::spawn(async move {
        reqwest::Client::new()
            .get(url)
            .header(AUTH_HEADER, token)
            .send()
            .await
            .unwrap()
    })
}

#[tokio::test]
async fn test_silent_client_times_out() {
    let mut config = common::server_config();
    config.server.relay_timeout_secs = 1;
    let server = common::start_server(config, None).await;
    let _tunnel = common::connect_raw(&server, "silent").await;

    let started = std::time::Instant::now();
    let res = reqwest::Client::new()
        .get(server.url("/broker/anything"))
        .header(AUTH_HEADER, "silent")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() >= Duration::from_secs(1));
    let channel = server.registry.get("silent").unwrap();
    assert_eq!(channel.pending().count(), 0);
}

#[tokio::test]
async fn test_tunnel_drop_fails_pending_request() {
    let server = common::start_server(common::server_config(), None).await;
    let mut tunnel = common::connect_raw(&server, "vanishing").await;

    let request = spawn_get(server.url("/broker/echo-param/xyz"), "vanishing");
    common::next_request(&mut tunnel).await;
    drop(tunnel);

    let res = request.await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

    for _ in 0..50 {
        if !server.registry.has("vanishing") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!server.registry.has("vanishing"));
}

#[tokio::test]
async fn test_reidentify_supersedes_previous_tunnel() {
    let server = common::start_server(common::server_config(), None).await;
    let mut first = common::connect_raw(&server, "dup").await;
    let first_channel = server.registry.get("dup").unwrap().id();

    let orphaned = spawn_get(server.url("/broker/one"), "dup");
    common::next_request(&mut first).await;

    let mut second = common::connect_raw(&server, "dup").await;
    for _ in 0..50 {
        if server.registry.get("dup").is_some_and(|c| c.id() != first_channel) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // the request in flight on the replaced tunnel fails instead of hanging
    assert_eq!(orphaned.await.unwrap().status(), StatusCode::BAD_GATEWAY);
    // and the replaced tunnel is closed by the server
    assert!(common::next_frame(&mut first).await.is_none());

    let answered = spawn_get(server.url("/broker/two"), "dup");
    let Frame::RequestHead { id, head } = common::next_request(&mut second).await else {
        unreachable!()
    };
    assert_eq!(head.url, "/two");
    common::send_frame(
        &mut second,
        Frame::ResponseHead {
            id,
            head: ResponseHead::plain(200),
        },
    )
    .await;
    common::send_frame(
        &mut second,
        Frame::Chunk {
            id,
            data: Bytes::from_static(b"from-second"),
        },
    )
    .await;
    common::send_frame(&mut second, Frame::End { id }).await;

    let res = answered.await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "from-second");
    assert_eq!(server.registry.len(), 1);
}

#[tokio::test]
async fn test_client_abort_before_head() {
    let server = common::start_server(common::server_config(), None).await;
    let mut tunnel = common::connect_raw(&server, "aborting").await;

    let request = spawn_get(server.url("/broker/thing"), "aborting");
    let Frame::RequestHead { id, .. } = common::next_request(&mut tunnel).await else {
        unreachable!()
    };
    common::send_frame(
        &mut tunnel,
        Frame::Abort {
            id,
            reason: "connection refused".into(),
        },
    )
    .await;

    let res = request.await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    assert!(res.text().await.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_late_response_is_discarded() {
    let mut config = common::server_config();
    config.server.relay_timeout_secs = 1;
    let server = common::start_server(config, None).await;
    let mut tunnel = common::connect_raw(&server, "late").await;

    let request = spawn_get(server.url("/broker/slow"), "late");
    let Frame::RequestHead { id, .. } = common::next_request(&mut tunnel).await else {
        unreachable!()
    };
    assert_eq!(request.await.unwrap().status(), StatusCode::GATEWAY_TIMEOUT);

    // answering after the deadline neither fails nor leaks the id
    common::send_frame(
        &mut tunnel,
        Frame::ResponseHead {
            id,
            head: ResponseHead::plain(200),
        },
    )
    .await;
    common::send_frame(&mut tunnel, Frame::End { id }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let channel = server.registry.get("late").unwrap();
    assert_eq!(channel.pending().count(), 0);
}

#[tokio::test]
async fn test_unidentified_socket_is_dropped() {
    let mut config = common::server_config();
    config.server.identify_timeout_secs = 1;
    let server = common::start_server(config, None).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(server.tunnel_url()).await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(3), common::next_frame(&mut ws)).await;
    assert!(matches!(closed, Ok(None)));
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn test_binary_identify_is_rejected() {
    let server = common::start_server(common::server_config(), None).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(server.tunnel_url()).await.unwrap();
    ws.send(Message::Binary(Bytes::from_static(b"12345"))).await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(3), common::next_frame(&mut ws)).await;
    assert!(matches!(closed, Ok(None)));
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn test_private_service_down() {
    let server = common::start_server(common::server_config(), None).await;

    // an origin address nobody listens on
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let config = common::client_config(server.addr, dead_addr);
    let rules = tunnel_broker::filters::Ruleset::new(vec![common::rule("any", "/**")]);
    common::start_client(&config, rules, dead_addr, &server.shutdown);
    common::wait_for_token(&server.registry, TOKEN).await;

    let res = reqwest::Client::new()
        .get(server.url("/broker/echo-param/xyz"))
        .header(AUTH_HEADER, TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_client_reconnects_after_channel_loss() {
    let stack = common::start_stack().await;
    let before = stack.server.registry.get(TOKEN).unwrap();
    before.close();

    let mut reconnected = false;
    for _ in 0..250 {
        if stack.server.registry.get(TOKEN).is_some_and(|c| c.id() != before.id()) {
            reconnected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reconnected, "client never re-identified");

    let res = reqwest::Client::new()
        .get(stack.server.url("/broker/echo-param/again"))
        .header(AUTH_HEADER, TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "again");
}

#[tokio::test]
async fn test_shutdown_closes_channels() {
    let server = common::start_server(common::server_config(), None).await;
    let mut tunnel = common::connect_raw(&server, "closing").await;

    server.shutdown.trigger("test");

    let closed = tokio::time::timeout(Duration::from_secs(3), common::next_frame(&mut tunnel)).await;
    assert!(matches!(closed, Ok(None)));
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn test_timeout_aborts_request_on_tunnel() {
    let mut config = common::server_config();
    config.server.relay_timeout_secs = 1;
    let server = common::start_server(config, None).await;
    let mut tunnel = common::connect_raw(&server, "abandoned").await;

    let request = spawn_get(server.url("/broker/slow"), "abandoned");
    let Frame::RequestHead { id, .. } = common::next_request(&mut tunnel).await else {
        unreachable!()
    };
    assert_eq!(request.await.unwrap().status(), StatusCode::GATEWAY_TIMEOUT);

    // the client is told to stop working on the request
    match common::next_frame(&mut tunnel).await {
        Some(Frame::Abort { id: aborted, .. }) => assert_eq!(aborted, id),
        other => panic!("expected abort, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stalled_body_fails_caller() {
    let mut config = common::server_config();
    config.server.relay_timeout_secs = 1;
    let server = common::start_server(config, None).await;
    let mut tunnel = common::connect_raw(&server, "stalling").await;

    let request = spawn_get(server.url("/broker/stream"), "stalling");
    let Frame::RequestHead { id, .. } = common::next_request(&mut tunnel).await else {
        unreachable!()
    };
    common::send_frame(
        &mut tunnel,
        Frame::ResponseHead {
            id,
            head: ResponseHead::plain(200),
        },
    )
    .await;
    common::send_frame(
        &mut tunnel,
        Frame::Chunk {
            id,
            data: Bytes::from_static(b"partial"),
        },
    )
    .await;

    let res = request.await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    // no End ever comes: the body fails instead of hanging
    let body = tokio::time::timeout(Duration::from_secs(5), res.bytes()).await.unwrap();
    assert!(body.is_err());

    let channel = server.registry.get("stalling").unwrap();
    assert_eq!(channel.pending().count(), 0);
    assert!(matches!(common::next_frame(&mut tunnel).await, Some(Frame::Abort { .. })));
}

