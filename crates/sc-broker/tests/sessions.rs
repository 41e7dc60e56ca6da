// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session lifecycle through the connection handler.

mod common;

use common::*;
use sc_broker::{BrokerConfig, ServiceConfig};
use scmp::{HeaderKey, Message, MessageType};
use std::time::Duration;

fn config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.add_service(ServiceConfig::session("S"));
    config
}

#[tokio::test]
async fn test_single_slot_server_is_shared_in_turn() {
    let (broker, connector) = broker(config());
    let _backend = FakeBackend::start(&connector, 7001);
    let mut registrar = TestClient::connect(&broker);
    assert!(!registrar.register("S", 7001, 1).await.fault);

    let mut a = TestClient::connect(&broker);
    let mut b = TestClient::connect(&broker);
    a.attach().await;
    b.attach().await;

    let session_a = session_id(&a.create_session("S").await);
    let refused = b.create_session("S").await;
    assert!(refused.fault);
    assert_eq!(error_code(&refused), Some("404"));

    assert!(!a.delete_session(&session_a).await.fault);
    let session_b = session_id(&b.create_session("S").await);
    assert_ne!(session_a, session_b);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_respect_max_sessions() {
    const MAX: usize = 3;
    const CLIENTS: usize = 12;

    let (broker, connector) = broker(config());
    let _backend = FakeBackend::start(&connector, 7002);
    let mut registrar = TestClient::connect(&broker);
    assert!(!registrar.register("S", 7002, MAX).await.fault);

    let mut tasks = Vec::new();
    for _ in 0..CLIENTS {
        let broker = broker.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = TestClient::connect(&broker);
            client.attach().await;
            let reply = client.create_session("S").await;
            // Keep the client (and its session) alive until counted.
            (reply, client)
        }));
    }

    let mut ok = 0;
    let mut refused = 0;
    let mut clients = Vec::new();
    for task in tasks {
        let (reply, client) = task.await.unwrap();
        if reply.fault {
            assert_eq!(error_code(&reply), Some("404"));
            refused += 1;
        } else {
            ok += 1;
        }
        clients.push(client);
    }

    assert_eq!(ok, MAX);
    assert_eq!(refused, CLIENTS - MAX);
    let server = &broker.servers().all()[0];
    assert_eq!(server.current_sessions(), MAX);
    assert_eq!(broker.sessions().len(), MAX);
}

#[tokio::test]
async fn test_message_ids_increase_and_stale_id_faults() {
    let (broker, connector) = broker(config());
    let backend = FakeBackend::start(&connector, 7003);
    let mut registrar = TestClient::connect(&broker);
    registrar.register("S", 7003, 4).await;

    let mut client = TestClient::connect(&broker);
    client.attach().await;
    let session = session_id(&client.create_session("S").await);

    let mut last = 0u64;
    for id in 1..=5u64 {
        let reply = client
            .call(
                Message::request(MessageType::ClnData)
                    .with_header(HeaderKey::SessionId, session.as_str())
                    .with_header(HeaderKey::MessageId, id.to_string())
                    .with_body(format!("req-{}", id)),
            )
            .await;
        assert!(!reply.fault, "{:?}", reply);
        assert_eq!(reply.body, format!("req-{}", id).into_bytes());
        let echoed: u64 = reply.message_id().unwrap().parse().unwrap();
        assert!(echoed > last);
        last = echoed;
    }

    let stale = client
        .call(
            Message::request(MessageType::ClnData)
                .with_header(HeaderKey::SessionId, session.as_str())
                .with_header(HeaderKey::MessageId, "3"),
        )
        .await;
    assert_eq!(error_code(&stale), Some("422"));

    // Without an id the broker assigns the next one.
    let assigned = client.cln_data(&session, "x").await;
    assert_eq!(assigned.message_id(), Some("6"));

    // The backend sees its own strictly increasing sequence per session.
    let forwarded: Vec<u64> = backend
        .received()
        .iter()
        .filter(|m| m.session_id() == Some(session.as_str()))
        .map(|m| m.message_id().unwrap().parse().unwrap())
        .collect();
    assert!(forwarded.windows(2).all(|w| w[0] < w[1]), "{:?}", forwarded);
}

#[tokio::test]
async fn test_deregistered_server_loses_sessions() {
    let (broker, connector) = broker(config());
    let backend = FakeBackend::start(&connector, 7004);
    let mut registrar = TestClient::connect(&broker);
    registrar.register("S", 7004, 4).await;

    let mut client = TestClient::connect(&broker);
    client.attach().await;
    let session = session_id(&client.create_session("S").await);
    assert!(!client.cln_data(&session, "before").await.fault);

    let deregister = registrar
        .call(
            Message::request(MessageType::DeregisterService)
                .with_header(HeaderKey::ServiceName, "S")
                .with_header(HeaderKey::PortNr, "7004")
                .with_header(HeaderKey::IpAddressList, BACKEND_HOST),
        )
        .await;
    assert!(!deregister.fault);
    assert!(broker.servers().is_empty());

    let lost = client.cln_data(&session, "after").await;
    assert!(lost.fault);
    assert_eq!(error_code(&lost), Some("503"));
    assert_eq!(backend.received_of(MessageType::SrvData).len(), 1);

    // Deleting acknowledges the abort; the id is then unknown.
    assert!(!client.delete_session(&session).await.fault);
    assert_eq!(error_code(&client.cln_data(&session, "x").await), Some("404"));
}

#[tokio::test]
async fn test_rejected_session_frees_slot() {
    let (broker, connector) = broker(config());
    let backend = FakeBackend::start(&connector, 7005);
    let mut registrar = TestClient::connect(&broker);
    registrar.register("S", 7005, 1).await;

    let mut client = TestClient::connect(&broker);
    client.attach().await;
    backend.reject(true);
    let refused = client.create_session("S").await;
    assert_eq!(error_code(&refused), Some("407"));
    assert_eq!(broker.servers().all()[0].current_sessions(), 0);

    backend.reject(false);
    session_id(&client.create_session("S").await);
}

#[tokio::test]
async fn test_idle_session_is_reaped() {
    let mut config = config();
    config.echo_grace_factor = 1;
    config.reaper_interval_ms = 50;
    let (broker, connector) = broker(config);
    let _tasks = broker.start();
    let backend = FakeBackend::start(&connector, 7006);
    let mut registrar = TestClient::connect(&broker);
    registrar.register("S", 7006, 1).await;

    let mut client = TestClient::connect(&broker);
    client.attach().await;
    let reply = client
        .call(
            Message::request(MessageType::CreateSession)
                .with_header(HeaderKey::ServiceName, "S")
                .with_header(HeaderKey::EchoInterval, "1"),
        )
        .await;
    let session = session_id(&reply);

    assert!(eventually(|| broker.sessions().is_empty()).await);
    assert!(eventually(|| !backend.received_of(MessageType::SrvAbortSession).is_empty()).await);
    assert_eq!(broker.servers().all()[0].current_sessions(), 0);
    assert_eq!(error_code(&client.cln_data(&session, "late").await), Some("503"));

    broker.shutdown();
}

#[tokio::test]
async fn test_echo_keeps_session_alive() {
    let mut config = config();
    config.echo_grace_factor = 1;
    config.reaper_interval_ms = 50;
    let (broker, connector) = broker(config);
    let _tasks = broker.start();
    let backend = FakeBackend::start(&connector, 7007);
    let mut registrar = TestClient::connect(&broker);
    registrar.register("S", 7007, 1).await;

    let mut client = TestClient::connect(&broker);
    client.attach().await;
    let reply = client
        .call(
            Message::request(MessageType::CreateSession)
                .with_header(HeaderKey::ServiceName, "S")
                .with_header(HeaderKey::EchoInterval, "1"),
        )
        .await;
    let session = session_id(&reply);

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        let echo = client
            .call(Message::request(MessageType::Echo).with_header(HeaderKey::SessionId, session.as_str()))
            .await;
        assert!(!echo.fault, "{:?}", echo);
    }
    assert_eq!(broker.sessions().len(), 1);
    assert_eq!(backend.received_of(MessageType::SrvEcho).len(), 4);

    broker.shutdown();
}

#[tokio::test]
async fn test_out_of_range_intervals_are_refused() {
    let (broker, connector) = broker(config());
    let _backend = FakeBackend::start(&connector, 7008);
    let mut registrar = TestClient::connect(&broker);
    let forever = registrar
        .call(
            register_request("S", 7008, 1)
                .with_header(HeaderKey::KeepAliveInterval, "10000000000000000000"),
        )
        .await;
    assert_eq!(error_code(&forever), Some("411"));
    assert!(broker.servers().is_empty());
    assert!(!registrar.register("S", 7008, 1).await.fault);

    let mut client = TestClient::connect(&broker);
    client.attach().await;
    let reply = client
        .call(
            Message::request(MessageType::CreateSession)
                .with_header(HeaderKey::ServiceName, "S")
                .with_header(HeaderKey::EchoInterval, "10000000000000000000"),
        )
        .await;
    assert_eq!(error_code(&reply), Some("411"));
    assert_eq!(broker.servers().all()[0].current_sessions(), 0);

    // The single slot is still there.
    session_id(&client.create_session("S").await);
}

#[tokio::test]
async fn test_failed_create_frees_slot() {
    let (broker, connector) = broker(config());
    let backend = FakeBackend::start(&connector, 7009);
    let mut registrar = TestClient::connect(&broker);
    registrar.register("S", 7009, 1).await;
    backend.kill();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut client = TestClient::connect(&broker);
    client.attach().await;
    let lost = client.create_session("S").await;
    assert_eq!(error_code(&lost), Some("503"));
    assert!(broker.sessions().is_empty());
    assert_eq!(broker.servers().all()[0].current_sessions(), 0);

    let _backend = FakeBackend::start(&connector, 7009);
    session_id(&client.create_session("S").await);
}

#[tokio::test]
async fn test_echo_to_lost_backend_aborts_session() {
    let (broker, connector) = broker(config());
    let backend = FakeBackend::start(&connector, 7010);
    let mut registrar = TestClient::connect(&broker);
    registrar.register("S", 7010, 1).await;

    let mut client = TestClient::connect(&broker);
    client.attach().await;
    let session = session_id(&client.create_session("S").await);
    backend.kill();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let echo = client
        .call(Message::request(MessageType::Echo).with_header(HeaderKey::SessionId, session.as_str()))
        .await;
    assert_eq!(error_code(&echo), Some("503"));
    assert!(broker.sessions().is_empty());
    assert_eq!(broker.servers().all()[0].current_sessions(), 0);
    assert_eq!(error_code(&client.cln_data(&session, "x").await), Some("503"));
}

#[tokio::test]
async fn test_large_body_crosses_the_broker_in_parts() {
    let mut config = config();
    config.large_message_limit = 4 * 1024;
    let (broker, connector) = broker(config);
    let backend = FakeBackend::start(&connector, 7011);
    let mut registrar = TestClient::connect(&broker);
    registrar.register("S", 7011, 1).await;

    let mut client = TestClient::connect(&broker);
    client.attach().await;
    let session = session_id(&client.create_session("S").await);

    // Larger than every writer's part limit, so each hop is split.
    let body: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let reply = client
        .call(
            Message::request(MessageType::ClnData)
                .with_header(HeaderKey::SessionId, session.as_str())
                .with_body(body.clone()),
        )
        .await;
    assert!(!reply.fault, "{:?}", reply.header);
    assert!(!reply.part);
    assert_eq!(reply.body, body);

    let forwarded = backend.received_of(MessageType::SrvData);
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].body, body);
}
