// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared fixtures: an in-memory backend server and a client speaking SCMP
//! to a broker connection handler.

#![allow(dead_code)]

use parking_lot::Mutex;
use sc_broker::{serve_connection, Broker, BrokerConfig, Dispatcher, Endpoint, MemoryConnector};
use scmp::{FrameReader, FrameWriter, HeaderKey, Message, MessageType};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

pub const BACKEND_HOST: &str = "backend";
pub const WAIT: Duration = Duration::from_secs(5);

/// Broker reaching its backends through an in-memory connector.
pub fn broker(config: BrokerConfig) -> (Arc<Broker>, Arc<MemoryConnector>) {
    let connector = Arc::new(MemoryConnector::new());
    let broker = Broker::new(config, connector.clone()).expect("valid config");
    (broker, connector)
}

/// Poll `check` until it holds or [`WAIT`] elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Backend server on `backend:<port>`: answers every request with a reply
/// echoing the body, answers keep-alive probes, and records what it saw.
pub struct FakeBackend {
    pub endpoint: Endpoint,
    log: Arc<Mutex<Vec<Message>>>,
    accepted: Arc<AtomicUsize>,
    reject: Arc<AtomicBool>,
    silent: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    task: JoinHandle<()>,
}

impl FakeBackend {
    pub fn start(connector: &MemoryConnector, port: u16) -> Self {
        let endpoint = Endpoint::new(BACKEND_HOST, port);
        let mut listener = connector.listen(endpoint.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let reject = Arc::new(AtomicBool::new(false));
        let silent = Arc::new(AtomicBool::new(false));

        let connections = Arc::new(Mutex::new(Vec::new()));

        let (l, a, r, s) = (log.clone(), accepted.clone(), reject.clone(), silent.clone());
        let c = connections.clone();
        let task = tokio::spawn(async move {
            while let Some(stream) = listener.accept().await {
                a.fetch_add(1, Ordering::SeqCst);
                let conn = tokio::spawn(serve_backend(stream, l.clone(), r.clone(), s.clone()));
                c.lock().push(conn);
            }
        });

        Self {
            endpoint,
            log,
            accepted,
            reject,
            silent,
            connections,
            task,
        }
    }

    /// Crash: stop listening and drop every open connection.
    pub fn kill(&self) {
        self.task.abort();
        for conn in self.connections.lock().drain(..) {
            conn.abort();
        }
    }

    /// Refuse sessions and subscriptions from now on.
    pub fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Stop answering keep-alive probes.
    pub fn silence_keep_alive(&self) {
        self.silent.store(true, Ordering::SeqCst);
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Message> {
        self.log.lock().clone()
    }

    pub fn received_of(&self, msg_type: MessageType) -> Vec<Message> {
        self.received()
            .into_iter()
            .filter(|m| m.header.get(HeaderKey::MsgType) == Some(msg_type.as_str()))
            .collect()
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn serve_backend(
    stream: DuplexStream,
    log: Arc<Mutex<Vec<Message>>>,
    reject: Arc<AtomicBool>,
    silent: Arc<AtomicBool>,
) {
    let (r, w) = tokio::io::split(stream);
    let mut reader = FrameReader::new(r, scmp::DEFAULT_MAX_MESSAGE_SIZE);
    let mut writer = FrameWriter::new(w, scmp::DEFAULT_LARGE_MESSAGE_LIMIT);
    while let Ok(Some(msg)) = reader.read_message().await {
        if msg.keep_alive {
            if silent.load(Ordering::SeqCst) {
                continue;
            }
            if writer
                .write_message(&Message::keep_alive_response())
                .await
                .is_err()
            {
                break;
            }
            continue;
        }
        let mut reply = Message::reply_to(&msg).with_body(msg.body.clone());
        let refusable = matches!(
            msg.message_type(),
            Some(Ok(MessageType::SrvCreateSession | MessageType::SrvSubscribe))
        );
        if refusable && reject.load(Ordering::SeqCst) {
            reply.header.set(HeaderKey::Reject, "true");
            reply.header.set(HeaderKey::AppErrorText, "go away");
        }
        log.lock().push(msg);
        if writer.write_message(&reply).await.is_err() {
            break;
        }
    }
}

/// Client side of a broker connection.
pub struct TestClient {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
    pushes: VecDeque<Message>,
    pub handler: JoinHandle<Result<(), scmp::FrameDecoderError>>,
}

impl TestClient {
    pub fn connect(broker: &Arc<Broker>) -> Self {
        Self::connect_from(broker, None)
    }

    pub fn connect_from(broker: &Arc<Broker>, peer: Option<SocketAddr>) -> Self {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let handler = tokio::spawn(serve_connection(
            broker.clone(),
            Arc::new(Dispatcher::new()),
            remote,
            peer,
        ));
        let (r, w) = tokio::io::split(local);
        Self {
            reader: FrameReader::new(r, scmp::DEFAULT_MAX_MESSAGE_SIZE),
            writer: FrameWriter::new(w, scmp::DEFAULT_LARGE_MESSAGE_LIMIT),
            pushes: VecDeque::new(),
            handler,
        }
    }

    pub async fn send(&mut self, msg: &Message) {
        self.writer.write_message(msg).await.expect("send");
    }

    /// Next frame from the broker, `None` once the connection is closed.
    pub async fn read(&mut self) -> Option<Message> {
        tokio::time::timeout(WAIT, self.reader.read_message())
            .await
            .expect("broker did not answer in time")
            .ok()
            .flatten()
    }

    /// Send a request and wait for its reply. Pushes arriving first are
    /// kept for [`TestClient::next_push`].
    pub async fn call(&mut self, msg: Message) -> Message {
        self.send(&msg).await;
        loop {
            let frame = self.read().await.expect("connection closed");
            if frame.reply {
                return frame;
            }
            self.pushes.push_back(frame);
        }
    }

    pub async fn next_push(&mut self) -> Message {
        if let Some(push) = self.pushes.pop_front() {
            return push;
        }
        let frame = self.read().await.expect("connection closed");
        assert!(!frame.reply, "expected a push, got {:?}", frame);
        frame
    }

    /// Push already received or arriving within `wait`.
    pub async fn try_push(&mut self, wait: Duration) -> Option<Message> {
        if let Some(push) = self.pushes.pop_front() {
            return Some(push);
        }
        tokio::time::timeout(wait, self.reader.read_message())
            .await
            .ok()
            .and_then(|r| r.ok().flatten())
    }

    pub async fn attach(&mut self) {
        let reply = self.call(Message::request(MessageType::Attach)).await;
        assert!(!reply.fault, "attach failed: {:?}", reply);
    }

    pub async fn create_session(&mut self, service: &str) -> Message {
        self.call(
            Message::request(MessageType::CreateSession).with_header(HeaderKey::ServiceName, service),
        )
        .await
    }

    pub async fn cln_data(&mut self, session: &str, body: &str) -> Message {
        self.call(
            Message::request(MessageType::ClnData)
                .with_header(HeaderKey::SessionId, session)
                .with_body(body),
        )
        .await
    }

    pub async fn delete_session(&mut self, session: &str) -> Message {
        self.call(
            Message::request(MessageType::DeleteSession).with_header(HeaderKey::SessionId, session),
        )
        .await
    }

    pub async fn subscribe(&mut self, service: &str, mask: &str) -> Message {
        self.call(
            Message::request(MessageType::Subscribe)
                .with_header(HeaderKey::ServiceName, service)
                .with_header(HeaderKey::Mask, mask),
        )
        .await
    }

    /// REGISTER_SERVICE for `backend:<port>`.
    pub async fn register(&mut self, service: &str, port: u16, max_sessions: usize) -> Message {
        self.call(register_request(service, port, max_sessions)).await
    }

    pub async fn publish(&mut self, service: &str, topic: &str, body: &str) -> Message {
        self.call(
            Message::request(MessageType::Publish)
                .with_header(HeaderKey::ServiceName, service)
                .with_header(HeaderKey::Mask, topic)
                .with_body(body),
        )
        .await
    }
}

pub fn register_request(service: &str, port: u16, max_sessions: usize) -> Message {
    Message::request(MessageType::RegisterService)
        .with_header(HeaderKey::ServiceName, service)
        .with_header(HeaderKey::MaxSessions, max_sessions.to_string())
        .with_header(HeaderKey::MaxConnections, "4")
        .with_header(HeaderKey::PortNr, port.to_string())
        .with_header(HeaderKey::IpAddressList, BACKEND_HOST)
}

pub fn error_code(reply: &Message) -> Option<&str> {
    reply.header.get(HeaderKey::ScErrorCode)
}

pub fn session_id(reply: &Message) -> String {
    assert!(!reply.fault, "unexpected fault: {:?}", reply);
    reply
        .session_id()
        .expect("reply carries a session id")
        .to_string()
}
