// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client commands: attach, sessions, subscriptions.

use super::{
    is_rejected, no_validation, parse_interval, relay_app_error, require, Command,
    ConnectionContext, Sequencing,
};
use crate::broker::Broker;
use crate::config::ServiceKind;
use crate::error::{ErrorCode, Fault};
use crate::events::{BrokerEvent, EndReason};
use crate::pubsub::{validate_mask, Subscription};
use crate::registry::{Service, Session};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use scmp::{HeaderKey, Message, MessageType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(super) fn commands() -> Vec<Command> {
    vec![
        Command {
            msg_type: MessageType::Attach,
            sequencing: Sequencing::Connection,
            validate: no_validation,
            run: run_attach,
        },
        Command {
            msg_type: MessageType::Detach,
            sequencing: Sequencing::Connection,
            validate: no_validation,
            run: run_detach,
        },
        Command {
            msg_type: MessageType::CreateSession,
            sequencing: Sequencing::Connection,
            validate: validate_create_session,
            run: run_create_session,
        },
        Command {
            msg_type: MessageType::DeleteSession,
            sequencing: Sequencing::Session,
            validate: validate_session_id,
            run: run_delete_session,
        },
        Command {
            msg_type: MessageType::ClnData,
            sequencing: Sequencing::Session,
            validate: validate_session_id,
            run: run_cln_data,
        },
        Command {
            msg_type: MessageType::Echo,
            sequencing: Sequencing::Session,
            validate: validate_session_id,
            run: run_echo,
        },
        Command {
            msg_type: MessageType::Subscribe,
            sequencing: Sequencing::Connection,
            validate: validate_subscribe,
            run: run_subscribe,
        },
        Command {
            msg_type: MessageType::ChangeSubscription,
            sequencing: Sequencing::Session,
            validate: validate_change_subscription,
            run: run_change_subscription,
        },
        Command {
            msg_type: MessageType::Unsubscribe,
            sequencing: Sequencing::Session,
            validate: validate_session_id,
            run: run_unsubscribe,
        },
    ]
}

fn run_attach<'a>(ctx: &'a ConnectionContext, msg: &'a Message) -> BoxFuture<'a, Result<Message, Fault>> {
    let result = if ctx.set_attached(true) {
        Err(Fault::new(
            ErrorCode::AlreadyConnected,
            "connection is already attached",
        ))
    } else {
        debug!(connection = ctx.id(), "attached");
        Ok(Message::reply_to(msg))
    };
    future::ready(result).boxed()
}

fn run_detach<'a>(ctx: &'a ConnectionContext, msg: &'a Message) -> BoxFuture<'a, Result<Message, Fault>> {
    let result = if ctx.set_attached(false) {
        debug!(connection = ctx.id(), "detached");
        Ok(Message::reply_to(msg))
    } else {
        Err(Fault::new(
            ErrorCode::NotConnected,
            "connection is not attached",
        ))
    };
    future::ready(result).boxed()
}

fn validate_create_session(ctx: &ConnectionContext, msg: &Message) -> Result<(), Fault> {
    ctx.require_attached()?;
    require(msg, HeaderKey::ServiceName)?;
    echo_interval(msg)?;
    Ok(())
}

/// `echoInterval` in seconds, zero refused.
fn echo_interval(msg: &Message) -> Result<Option<Duration>, Fault> {
    match parse_interval(msg, HeaderKey::EchoInterval)? {
        Some(interval) if interval.is_zero() => Err(Fault::invalid(HeaderKey::EchoInterval, "0")),
        other => Ok(other),
    }
}

/// A session the backend has not accepted yet. Unless [`PendingSession::accept`]
/// runs, dropping it ends the session as failed, whatever way the create
/// command exits.
struct PendingSession<'a> {
    broker: &'a Broker,
    session: Arc<Session>,
    settled: bool,
}

impl<'a> PendingSession<'a> {
    fn new(broker: &'a Broker, session: Arc<Session>) -> Self {
        Self {
            broker,
            session,
            settled: false,
        }
    }

    fn accept(mut self) -> Result<Arc<Session>, Fault> {
        self.session.activate()?;
        self.settled = true;
        Ok(self.session.clone())
    }

    fn end(mut self, reason: EndReason) {
        self.settled = true;
        self.broker.end_session(self.session.id(), reason);
    }
}

impl Drop for PendingSession<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.broker.end_session(self.session.id(), EndReason::Failed);
        }
    }
}

/// A lost backend takes the session down with it.
fn abort_on_lost(broker: &Broker, session: &Session, fault: Fault) -> Fault {
    if fault.code == ErrorCode::ConnectionLost {
        warn!(session = %session.id(), %fault, "backend lost, aborting session");
        broker.end_session(session.id(), EndReason::ServerLost);
    }
    fault
}

fn service_of_kind(
    ctx: &ConnectionContext,
    name: &str,
    kind: ServiceKind,
) -> Result<Arc<Service>, Fault> {
    let service = ctx.broker().services().lookup(name)?;
    if service.kind() != kind {
        return Err(Fault::new(
            ErrorCode::ServiceTypeMismatch,
            format!("service {:?} is not a {} service", name, kind.as_str()),
        ));
    }
    Ok(service)
}

fn run_create_session<'a>(
    ctx: &'a ConnectionContext,
    msg: &'a Message,
) -> BoxFuture<'a, Result<Message, Fault>> {
    async move {
        let broker = ctx.broker();
        let name = require(msg, HeaderKey::ServiceName)?;
        let service = service_of_kind(ctx, name, ServiceKind::Session)?;
        let interval = broker.echo_interval_for(&service, echo_interval(msg)?);
        let session_info = msg.header.get(HeaderKey::SessionInfo).map(str::to_string);
        let session = broker
            .sessions()
            .create(&service, interval, session_info)?;
        let pending = PendingSession::new(broker, session.clone());

        let mut forward = Message::request(MessageType::SrvCreateSession)
            .with_header(HeaderKey::ServiceName, name)
            .with_header(HeaderKey::SessionId, session.id())
            .with_header(HeaderKey::EchoInterval, interval.as_secs().to_string())
            .with_body(msg.body.clone());
        if let Some(info) = session.session_info() {
            forward.header.set(HeaderKey::SessionInfo, info);
        }
        if let Some(peer) = ctx.peer() {
            forward.header.set(HeaderKey::IpAddressList, peer.ip().to_string());
        }
        forward.set_message_id(session.next_outbound_id());

        let backend_reply = broker.exchange(session.server(), &forward).await?;
        if is_rejected(&backend_reply) {
            pending.end(EndReason::Rejected);
            let text = backend_reply
                .header
                .get(HeaderKey::AppErrorText)
                .unwrap_or("session rejected by server");
            return Err(Fault::new(ErrorCode::SessionRejected, text));
        }
        let session = pending.accept()?;

        info!(session = %session.id(), server = %session.server().key(), "session created");
        broker.events().emit(BrokerEvent::SessionCreated {
            session_id: session.id().to_string(),
            service: name.to_string(),
            endpoint: session.server().endpoint().clone(),
        });
        let reply = Message::reply_to(msg)
            .with_header(HeaderKey::SessionId, session.id())
            .with_body(backend_reply.body.clone());
        Ok(relay_app_error(&backend_reply, reply))
    }
    .boxed()
}

fn validate_session_id(ctx: &ConnectionContext, msg: &Message) -> Result<(), Fault> {
    ctx.require_attached()?;
    require(msg, HeaderKey::SessionId)?;
    Ok(())
}

fn run_delete_session<'a>(
    ctx: &'a ConnectionContext,
    msg: &'a Message,
) -> BoxFuture<'a, Result<Message, Fault>> {
    async move {
        let broker = ctx.broker();
        let id = require(msg, HeaderKey::SessionId)?;
        let session = match broker.sessions().get(id) {
            Ok(session) => session,
            Err(fault) if fault.code == ErrorCode::ConnectionLost => {
                // Deleting an aborted session acknowledges the abort.
                broker.sessions().clear_tombstone(id);
                return Ok(Message::reply_to(msg));
            }
            Err(fault) => return Err(fault),
        };
        let message_id = session.accept_message_id(msg.message_id())?;
        session.begin_delete()?;

        let mut forward = Message::request(MessageType::SrvDeleteSession)
            .with_header(HeaderKey::ServiceName, session.service())
            .with_header(HeaderKey::SessionId, id);
        forward.set_message_id(session.next_outbound_id());
        if let Err(fault) = broker.exchange(session.server(), &forward).await {
            warn!(session = %id, %fault, "backend did not confirm session delete");
        }
        broker.end_session(id, EndReason::Deleted);

        let mut reply = Message::reply_to(msg);
        reply.set_message_id(message_id);
        Ok(reply)
    }
    .boxed()
}

fn run_cln_data<'a>(ctx: &'a ConnectionContext, msg: &'a Message) -> BoxFuture<'a, Result<Message, Fault>> {
    async move {
        let broker = ctx.broker();
        let id = require(msg, HeaderKey::SessionId)?;
        let session = broker.sessions().get(id)?;
        let message_id = session.accept_message_id(msg.message_id())?;
        session.ensure_active()?;
        session.touch();

        let mut forward = Message::request(MessageType::SrvData)
            .with_header(HeaderKey::ServiceName, session.service())
            .with_header(HeaderKey::SessionId, id)
            .with_body(msg.body.clone());
        for key in [HeaderKey::BodyType, HeaderKey::SessionInfo] {
            if let Some(value) = msg.header.get(key) {
                forward.header.set(key, value);
            }
        }
        forward.set_message_id(session.next_outbound_id());

        let backend_reply = broker
            .exchange(session.server(), &forward)
            .await
            .map_err(|fault| abort_on_lost(broker, &session, fault))?;

        let mut reply = Message::reply_to(msg).with_body(backend_reply.body.clone());
        reply.set_message_id(message_id);
        if let Some(body_type) = backend_reply.header.get(HeaderKey::BodyType) {
            reply.header.set(HeaderKey::BodyType, body_type);
        }
        Ok(relay_app_error(&backend_reply, reply))
    }
    .boxed()
}

fn run_echo<'a>(ctx: &'a ConnectionContext, msg: &'a Message) -> BoxFuture<'a, Result<Message, Fault>> {
    async move {
        let broker = ctx.broker();
        let id = require(msg, HeaderKey::SessionId)?;
        let session = broker.sessions().get(id)?;
        let message_id = session.accept_message_id(msg.message_id())?;
        session.ensure_active()?;
        session.touch();

        let mut probe = Message::request(MessageType::SrvEcho)
            .with_header(HeaderKey::ServiceName, session.service())
            .with_header(HeaderKey::SessionId, id);
        probe.set_message_id(session.next_outbound_id());
        broker
            .exchange(session.server(), &probe)
            .await
            .map_err(|fault| abort_on_lost(broker, &session, fault))?;

        let mut reply = Message::reply_to(msg);
        reply.set_message_id(message_id);
        Ok(reply)
    }
    .boxed()
}

fn validate_subscribe(ctx: &ConnectionContext, msg: &Message) -> Result<(), Fault> {
    ctx.require_attached()?;
    require(msg, HeaderKey::ServiceName)?;
    require(msg, HeaderKey::Mask)?;
    Ok(())
}

fn run_subscribe<'a>(ctx: &'a ConnectionContext, msg: &'a Message) -> BoxFuture<'a, Result<Message, Fault>> {
    async move {
        let broker = ctx.broker();
        let name = require(msg, HeaderKey::ServiceName)?;
        let mask = require(msg, HeaderKey::Mask)?;
        let service = service_of_kind(ctx, name, ServiceKind::Publish)?;
        validate_mask(mask, service.mask_length())?;
        // The first subscription fixes the length of an unconstrained service.
        validate_mask(mask, Some(service.adopt_mask_length(mask.chars().count())))?;

        let lease = service.allocate()?;
        let session_info = msg.header.get(HeaderKey::SessionInfo).map(str::to_string);
        let subscription = Subscription::new(
            lease,
            mask.to_string(),
            session_info,
            ctx.id(),
            ctx.push().clone(),
        );

        let mut forward = Message::request(MessageType::SrvSubscribe)
            .with_header(HeaderKey::ServiceName, name)
            .with_header(HeaderKey::SessionId, subscription.id())
            .with_header(HeaderKey::Mask, mask)
            .with_body(msg.body.clone());
        if let Some(info) = subscription.session_info() {
            forward.header.set(HeaderKey::SessionInfo, info);
        }
        forward.set_message_id(subscription.next_outbound_id());

        // Dropping `subscription` on any early return frees the server slot.
        let backend_reply = broker
            .exchange(subscription.server(), &forward)
            .await?;
        if is_rejected(&backend_reply) {
            let text = backend_reply
                .header
                .get(HeaderKey::AppErrorText)
                .unwrap_or("subscription rejected by server");
            return Err(Fault::new(ErrorCode::SessionRejected, text));
        }

        let subscription = broker.subscriptions().add(subscription);
        info!(
            subscription = %subscription.id(), service = name, mask,
            "subscription created"
        );
        broker.events().emit(BrokerEvent::SubscriptionCreated {
            subscription_id: subscription.id().to_string(),
            service: name.to_string(),
            mask: mask.to_string(),
        });
        let reply = Message::reply_to(msg).with_header(HeaderKey::SessionId, subscription.id());
        Ok(relay_app_error(&backend_reply, reply))
    }
    .boxed()
}

/// Subscription named by `sessionId`, owned by this connection.
fn own_subscription(ctx: &ConnectionContext, msg: &Message) -> Result<Arc<Subscription>, Fault> {
    let id = require(msg, HeaderKey::SessionId)?;
    let subscription = ctx.broker().subscriptions().get(id)?;
    if subscription.connection() != ctx.id() {
        return Err(Fault::not_found(format!("unknown subscription {:?}", id)));
    }
    Ok(subscription)
}

fn validate_change_subscription(ctx: &ConnectionContext, msg: &Message) -> Result<(), Fault> {
    validate_session_id(ctx, msg)?;
    require(msg, HeaderKey::Mask)?;
    Ok(())
}

fn run_change_subscription<'a>(
    ctx: &'a ConnectionContext,
    msg: &'a Message,
) -> BoxFuture<'a, Result<Message, Fault>> {
    async move {
        let broker = ctx.broker();
        let subscription = own_subscription(ctx, msg)?;
        let message_id = subscription.accept_message_id(msg.message_id())?;
        let mask = require(msg, HeaderKey::Mask)?;
        let service = broker.services().lookup(subscription.service())?;
        validate_mask(mask, service.mask_length())?;

        let mut forward = Message::request(MessageType::SrvChangeSubscription)
            .with_header(HeaderKey::ServiceName, subscription.service())
            .with_header(HeaderKey::SessionId, subscription.id())
            .with_header(HeaderKey::Mask, mask);
        forward.set_message_id(subscription.next_outbound_id());
        let backend_reply = broker
            .exchange(subscription.server(), &forward)
            .await?;
        if is_rejected(&backend_reply) {
            return Err(Fault::new(
                ErrorCode::SessionRejected,
                "subscription change rejected by server",
            ));
        }

        subscription.set_mask(mask.to_string());
        debug!(subscription = %subscription.id(), mask, "subscription changed");
        let mut reply = Message::reply_to(msg);
        reply.set_message_id(message_id);
        Ok(relay_app_error(&backend_reply, reply))
    }
    .boxed()
}

fn run_unsubscribe<'a>(
    ctx: &'a ConnectionContext,
    msg: &'a Message,
) -> BoxFuture<'a, Result<Message, Fault>> {
    async move {
        let broker = ctx.broker();
        let subscription = own_subscription(ctx, msg)?;
        let message_id = subscription.accept_message_id(msg.message_id())?;
        if broker.end_subscription(&subscription, EndReason::Deleted) {
            broker.notify_unsubscribe(&subscription).await;
        }
        let mut reply = Message::reply_to(msg);
        reply.set_message_id(message_id);
        Ok(reply)
    }
    .boxed()
}
