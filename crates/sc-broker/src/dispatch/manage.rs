// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MANAGE and INSPECT.
//!
//! Both take their directive from the body:
//!
//! ```text
//! MANAGE   ENABLE=<service> | DISABLE=<service> | KILL
//! INSPECT  <empty> | SERVICE=<service> | SESSIONS
//! ```
//!
//! Keywords are case-insensitive, service names are not.

use super::{no_validation, Command, ConnectionContext, Sequencing};
use crate::error::{ErrorCode, Fault};
use crate::events::BrokerEvent;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use scmp::{HeaderKey, Message, MessageType};
use serde::Serialize;
use tracing::info;

pub(super) fn commands() -> Vec<Command> {
    vec![
        Command {
            msg_type: MessageType::Manage,
            sequencing: Sequencing::Connection,
            validate: no_validation,
            run: run_manage,
        },
        Command {
            msg_type: MessageType::Inspect,
            sequencing: Sequencing::Connection,
            validate: no_validation,
            run: run_inspect,
        },
    ]
}

#[derive(Debug, PartialEq, Eq)]
enum Directive<'a> {
    Enable(&'a str),
    Disable(&'a str),
    Kill,
}

#[derive(Debug, PartialEq, Eq)]
enum Query<'a> {
    All,
    Service(&'a str),
    Sessions,
}

fn body_text(msg: &Message) -> Result<&str, Fault> {
    std::str::from_utf8(&msg.body)
        .map(str::trim)
        .map_err(|_| Fault::new(ErrorCode::InvalidAttribute, "body is not UTF-8"))
}

/// `KEY=value` with a case-insensitive key and a non-empty value.
fn keyed<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    let (k, value) = body.split_once('=')?;
    (k.eq_ignore_ascii_case(key) && !value.is_empty()).then_some(value)
}

fn parse_directive(body: &str) -> Option<Directive<'_>> {
    if body.eq_ignore_ascii_case("KILL") {
        Some(Directive::Kill)
    } else if let Some(name) = keyed(body, "ENABLE") {
        Some(Directive::Enable(name))
    } else {
        keyed(body, "DISABLE").map(Directive::Disable)
    }
}

fn parse_query(body: &str) -> Option<Query<'_>> {
    if body.is_empty() {
        Some(Query::All)
    } else if body.eq_ignore_ascii_case("SESSIONS") {
        Some(Query::Sessions)
    } else {
        keyed(body, "SERVICE").map(Query::Service)
    }
}

fn manage(ctx: &ConnectionContext, msg: &Message) -> Result<Message, Fault> {
    let body = body_text(msg)?;
    let broker = ctx.broker();
    let directive = parse_directive(body)
        .ok_or_else(|| Fault::not_found(format!("unrecognized manage directive {:?}", body)))?;
    let (name, enabled) = match directive {
        Directive::Kill => {
            info!(connection = ctx.id(), "shutdown requested by MANAGE");
            broker.shutdown();
            return Ok(Message::reply_to(msg));
        }
        Directive::Enable(name) => (name, true),
        Directive::Disable(name) => (name, false),
    };
    let previous = broker.services().set_state(name, enabled)?;
    if previous != enabled {
        info!(service = name, enabled, "service state changed");
        broker.events().emit(BrokerEvent::ServiceStateChanged {
            service: name.to_string(),
            enabled,
        });
    }
    Ok(Message::reply_to(msg))
}

fn run_manage<'a>(ctx: &'a ConnectionContext, msg: &'a Message) -> BoxFuture<'a, Result<Message, Fault>> {
    future::ready(manage(ctx, msg)).boxed()
}

fn json<T: Serialize>(report: &T) -> Result<Vec<u8>, Fault> {
    serde_json::to_vec_pretty(report)
        .map_err(|e| Fault::server_error(format!("cannot encode report: {}", e)))
}

fn inspect(ctx: &ConnectionContext, msg: &Message) -> Result<Message, Fault> {
    let body = body_text(msg)?;
    let broker = ctx.broker();
    let report = match parse_query(body) {
        Some(Query::All) => json(&broker.report())?,
        Some(Query::Service(name)) => json(&broker.service_report(name)?)?,
        Some(Query::Sessions) => json(&broker.sessions_report())?,
        None => {
            return Err(Fault::not_found(format!(
                "unrecognized inspect query {:?}",
                body
            )))
        }
    };
    Ok(Message::reply_to(msg)
        .with_header(HeaderKey::BodyType, "json")
        .with_body(report))
}

fn run_inspect<'a>(ctx: &'a ConnectionContext, msg: &'a Message) -> BoxFuture<'a, Result<Message, Fault>> {
    future::ready(inspect(ctx, msg)).boxed()
}
