// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backend commands: registration, publication, server-side unsubscribe.

use super::{
    parse_interval, parse_positive, require, require_parsed, Command, ConnectionContext,
    Sequencing,
};
use crate::broker::ServerRegistration;
use crate::config::ServiceKind;
use crate::error::{ErrorCode, Fault};
use crate::events::{EndReason, RemovalReason};
use crate::registry::ServerKey;
use crate::transport::Endpoint;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use scmp::{HeaderKey, Message, MessageType};
use tracing::{debug, info};

pub(super) fn commands() -> Vec<Command> {
    vec![
        Command {
            msg_type: MessageType::RegisterService,
            sequencing: Sequencing::Connection,
            validate: validate_register,
            run: run_register,
        },
        Command {
            msg_type: MessageType::DeregisterService,
            sequencing: Sequencing::Connection,
            validate: validate_deregister,
            run: run_deregister,
        },
        Command {
            msg_type: MessageType::Publish,
            sequencing: Sequencing::Connection,
            validate: validate_publish,
            run: run_publish,
        },
        Command {
            msg_type: MessageType::SrvUnsubscribe,
            sequencing: Sequencing::Connection,
            validate: validate_srv_unsubscribe,
            run: run_srv_unsubscribe,
        },
    ]
}

/// Endpoint a backend registers under: first `ipAddressList` entry (split
/// on `,` or `/`), else the peer address, with `portNr`.
fn server_endpoint(ctx: &ConnectionContext, msg: &Message) -> Result<Endpoint, Fault> {
    let port: u16 = require_parsed(msg, HeaderKey::PortNr)?;
    let listed = msg
        .header
        .get(HeaderKey::IpAddressList)
        .and_then(|list| list.split(|c: char| c == ',' || c == '/').map(str::trim).find(|h| !h.is_empty()));
    let host = match (listed, ctx.peer()) {
        (Some(host), _) => host.to_string(),
        (None, Some(peer)) => peer.ip().to_string(),
        (None, None) => return Err(Fault::missing(HeaderKey::IpAddressList)),
    };
    Ok(Endpoint::new(host, port))
}

fn service_kind(msg: &Message) -> Result<Option<ServiceKind>, Fault> {
    msg.header
        .get(HeaderKey::ServiceType)
        .map(|raw| ServiceKind::parse(raw).ok_or_else(|| Fault::invalid(HeaderKey::ServiceType, raw)))
        .transpose()
}

fn registration(ctx: &ConnectionContext, msg: &Message) -> Result<ServerRegistration, Fault> {
    let service = require(msg, HeaderKey::ServiceName)?;
    let max_sessions = parse_positive(msg, HeaderKey::MaxSessions)?
        .ok_or_else(|| Fault::missing(HeaderKey::MaxSessions))?;
    let mut reg = ServerRegistration::new(service, server_endpoint(ctx, msg)?, max_sessions);
    reg.max_connections = parse_positive(msg, HeaderKey::MaxConnections)?;
    reg.keep_alive_interval = parse_interval(msg, HeaderKey::KeepAliveInterval)?;
    reg.kind = service_kind(msg)?;
    reg.mask_length = parse_positive(msg, HeaderKey::MaskLength)?;
    Ok(reg)
}

fn validate_register(ctx: &ConnectionContext, msg: &Message) -> Result<(), Fault> {
    registration(ctx, msg).map(|_| ())
}

fn run_register<'a>(ctx: &'a ConnectionContext, msg: &'a Message) -> BoxFuture<'a, Result<Message, Fault>> {
    let result = registration(ctx, msg)
        .and_then(|reg| ctx.broker().register_server(reg))
        .map(|_| Message::reply_to(msg));
    future::ready(result).boxed()
}

fn validate_deregister(ctx: &ConnectionContext, msg: &Message) -> Result<(), Fault> {
    require(msg, HeaderKey::ServiceName)?;
    server_endpoint(ctx, msg)?;
    Ok(())
}

fn run_deregister<'a>(
    ctx: &'a ConnectionContext,
    msg: &'a Message,
) -> BoxFuture<'a, Result<Message, Fault>> {
    async move {
        let key = ServerKey::new(
            require(msg, HeaderKey::ServiceName)?,
            server_endpoint(ctx, msg)?,
        );
        ctx.broker()
            .remove_server(&key, RemovalReason::Deregistered)
            .await
            .ok_or_else(|| Fault::not_found(format!("server {} is not registered", key)))?;
        Ok(Message::reply_to(msg))
    }
    .boxed()
}

fn validate_publish(_: &ConnectionContext, msg: &Message) -> Result<(), Fault> {
    require(msg, HeaderKey::ServiceName)?;
    require(msg, HeaderKey::Mask)?;
    Ok(())
}

fn run_publish<'a>(ctx: &'a ConnectionContext, msg: &'a Message) -> BoxFuture<'a, Result<Message, Fault>> {
    let result = (|| -> Result<Message, Fault> {
        let broker = ctx.broker();
        let name = require(msg, HeaderKey::ServiceName)?;
        let topic = require(msg, HeaderKey::Mask)?;
        let service = broker.services().lookup(name)?;
        if service.kind() != ServiceKind::Publish {
            return Err(Fault::new(
                ErrorCode::ServiceTypeMismatch,
                format!("service {:?} is not a publish service", name),
            ));
        }
        if let Some(expected) = service.mask_length() {
            if topic.chars().count() != expected {
                return Err(Fault::invalid(HeaderKey::Mask, topic));
            }
        }
        let delivered = broker.publish(&service, topic, &msg.body);
        debug!(service = name, topic, delivered, "publication delivered");
        Ok(Message::reply_to(msg).with_body(delivered.to_string()))
    })();
    future::ready(result).boxed()
}

fn validate_srv_unsubscribe(_: &ConnectionContext, msg: &Message) -> Result<(), Fault> {
    require(msg, HeaderKey::ServiceName)?;
    require(msg, HeaderKey::SessionId)?;
    Ok(())
}

fn run_srv_unsubscribe<'a>(
    ctx: &'a ConnectionContext,
    msg: &'a Message,
) -> BoxFuture<'a, Result<Message, Fault>> {
    let result = (|| -> Result<Message, Fault> {
        let broker = ctx.broker();
        let name = require(msg, HeaderKey::ServiceName)?;
        let id = require(msg, HeaderKey::SessionId)?;
        let subscription = broker.subscriptions().get(id)?;
        if subscription.service() != name {
            return Err(Fault::not_found(format!(
                "subscription {:?} is not on service {:?}",
                id, name
            )));
        }
        if broker.end_subscription(&subscription, EndReason::AbortedByServer) {
            let app_error = msg.header.get(HeaderKey::AppErrorCode).map(|code| {
                (code, msg.header.get(HeaderKey::AppErrorText).unwrap_or(""))
            });
            let notice = subscription.abort_notice(EndReason::AbortedByServer, app_error);
            let delivered = subscription.push(notice);
            info!(subscription = %id, service = name, delivered, "subscription aborted by server");
        }
        Ok(Message::reply_to(msg))
    })();
    future::ready(result).boxed()
}
