// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command dispatcher.
//!
//! A table built once at startup maps each accepted [`MessageType`] to a
//! [`Command`]: a `validate` function that only inspects the request and a
//! `run` function that performs it. The dispatcher checks the message id,
//! validates, runs, and turns every failure (panics included) into an `EXC`
//! reply. Nothing a command does can end the connection.

mod backend;
mod client;
mod manage;

use crate::broker::Broker;
use crate::error::{ErrorCode, Fault};
use crate::events::BrokerEvent;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use scmp::{FrameKind, HeaderKey, Message, MessageSequencer, MessageType};
use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Per-connection state handed to every command.
#[derive(Debug)]
pub struct ConnectionContext {
    broker: Arc<Broker>,
    id: u64,
    peer: Option<SocketAddr>,
    push: mpsc::Sender<Message>,
    attached: AtomicBool,
    sequencer: Mutex<MessageSequencer>,
}

impl ConnectionContext {
    /// `push` feeds the connection's writer; publications and abort
    /// notices for this client go through it.
    pub fn new(broker: Arc<Broker>, peer: Option<SocketAddr>, push: mpsc::Sender<Message>) -> Self {
        Self {
            id: broker.next_connection_id(),
            broker,
            peer,
            push,
            attached: AtomicBool::new(false),
            sequencer: Mutex::new(MessageSequencer::new()),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn push(&self) -> &mpsc::Sender<Message> {
        &self.push
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Set the attach flag, returning the previous value.
    fn set_attached(&self, attached: bool) -> bool {
        self.attached.swap(attached, Ordering::AcqRel)
    }

    fn require_attached(&self) -> Result<(), Fault> {
        if self.is_attached() {
            Ok(())
        } else {
            Err(Fault::new(
                ErrorCode::NotConnected,
                "connection is not attached",
            ))
        }
    }
}

pub type ValidateFn = fn(&ConnectionContext, &Message) -> Result<(), Fault>;
pub type RunFn =
    for<'a> fn(&'a ConnectionContext, &'a Message) -> BoxFuture<'a, Result<Message, Fault>>;

/// Which counter checks a command's `messageId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequencing {
    /// The connection's counter, checked by the dispatcher.
    Connection,
    /// The session's (or subscription's) counter, checked by the command
    /// once it has found the session.
    Session,
}

#[derive(Clone, Copy)]
pub struct Command {
    pub msg_type: MessageType,
    pub sequencing: Sequencing,
    pub validate: ValidateFn,
    pub run: RunFn,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("msg_type", &self.msg_type)
            .field("sequencing", &self.sequencing)
            .finish()
    }
}

/// Message type -> command.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    commands: HashMap<MessageType, Command>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Table with every command the broker accepts.
    pub fn new() -> Self {
        let mut dispatcher = Self::empty();
        for command in client::commands()
            .into_iter()
            .chain(backend::commands())
            .chain(manage::commands())
        {
            dispatcher.register(command);
        }
        dispatcher
    }

    pub fn empty() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    /// Add or replace a command.
    pub fn register(&mut self, command: Command) -> Option<Command> {
        self.commands.insert(command.msg_type, command)
    }

    pub fn get(&self, msg_type: MessageType) -> Option<&Command> {
        self.commands.get(&msg_type)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Handle one request. Always yields a reply, either the command's or
    /// a fault.
    pub async fn dispatch(&self, ctx: &ConnectionContext, request: &Message) -> Message {
        match self.execute(ctx, request).await {
            Ok(reply) => reply,
            Err(fault) => {
                let msg_type = request.header.get(HeaderKey::MsgType);
                if fault.code == ErrorCode::ServerError {
                    warn!(connection = ctx.id(), msg_type, %fault, "command failed");
                } else {
                    debug!(connection = ctx.id(), msg_type, %fault, "command faulted");
                }
                ctx.broker().events().emit(BrokerEvent::Fault {
                    connection: ctx.id(),
                    msg_type: msg_type.map(str::to_string),
                    code: fault.code,
                    text: fault.text.clone(),
                });
                fault_reply(request, &fault)
            }
        }
    }

    async fn execute(&self, ctx: &ConnectionContext, request: &Message) -> Result<Message, Fault> {
        let msg_type = match request.message_type() {
            None => return Err(Fault::missing(HeaderKey::MsgType)),
            Some(Err(unknown)) => {
                return Err(Fault::new(
                    ErrorCode::UnknownMessageType,
                    unknown.to_string(),
                ))
            }
            Some(Ok(msg_type)) => msg_type,
        };
        let command = self.get(msg_type).ok_or_else(|| {
            Fault::new(
                ErrorCode::UnknownMessageType,
                format!("{} is not accepted by the broker", msg_type),
            )
        })?;

        let assigned = match command.sequencing {
            Sequencing::Connection => Some(ctx.sequencer.lock().accept(request.message_id())?),
            Sequencing::Session => None,
        };

        (command.validate)(ctx, request)?;

        let mut reply = AssertUnwindSafe((command.run)(ctx, request))
            .catch_unwind()
            .await
            .map_err(|panic| {
                error!(connection = ctx.id(), %msg_type, "command panicked");
                Fault::server_error(panic_message(panic.as_ref()))
            })??;

        if let Some(id) = assigned {
            reply.set_message_id(id);
        }
        Ok(reply)
    }
}

/// `EXC` reply for `request`: echoes type, message id and session id, and
/// carries the error code and text.
pub fn fault_reply(request: &Message, fault: &Fault) -> Message {
    Message::reply_to(request)
        .with_kind(FrameKind::Fault)
        .with_header(HeaderKey::ScErrorCode, fault.code.code().to_string())
        .with_header(HeaderKey::ScErrorText, fault.text.clone())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("internal error: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("internal error: {}", s)
    } else {
        "internal error".to_string()
    }
}

fn no_validation(_: &ConnectionContext, _: &Message) -> Result<(), Fault> {
    Ok(())
}

/// Non-empty attribute value.
fn require(msg: &Message, key: HeaderKey) -> Result<&str, Fault> {
    match msg.header.get(key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(Fault::missing(key)),
    }
}

/// Optional attribute parsed as `T`.
fn parse_attr<T: FromStr>(msg: &Message, key: HeaderKey) -> Result<Option<T>, Fault> {
    msg.header
        .get(key)
        .map(|raw| raw.parse().map_err(|_| Fault::invalid(key, raw)))
        .transpose()
}

fn require_parsed<T: FromStr>(msg: &Message, key: HeaderKey) -> Result<T, Fault> {
    parse_attr(msg, key)?.ok_or_else(|| Fault::missing(key))
}

/// Longest echo or keep-alive interval a peer may ask for.
pub const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Optional interval in seconds, at most [`MAX_INTERVAL_SECS`].
fn parse_interval(msg: &Message, key: HeaderKey) -> Result<Option<Duration>, Fault> {
    match parse_attr::<u64>(msg, key)? {
        Some(secs) if secs > MAX_INTERVAL_SECS => Err(Fault::new(
            ErrorCode::InvalidAttribute,
            format!("{} of {}s exceeds {}s", key, secs, MAX_INTERVAL_SECS),
        )),
        other => Ok(other.map(Duration::from_secs)),
    }
}

/// Optional strictly positive count.
fn parse_positive(msg: &Message, key: HeaderKey) -> Result<Option<usize>, Fault> {
    match parse_attr::<usize>(msg, key)? {
        Some(0) => Err(Fault::invalid(key, "0")),
        other => Ok(other),
    }
}

/// Backend replies with `reject=true` refuse the session or subscription.
fn is_rejected(reply: &Message) -> bool {
    reply
        .header
        .get(HeaderKey::Reject)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Copy application error attributes from a backend reply.
fn relay_app_error(from: &Message, mut to: Message) -> Message {
    for key in [HeaderKey::AppErrorCode, HeaderKey::AppErrorText] {
        if let Some(value) = from.header.get(key) {
            to.header.set(key, value);
        }
    }
    to
}
