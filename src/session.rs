//! Per-connection protocol engine.
//!
//! A session owns one connection from accept to close and drives the
//! read → gate → dispatch → reply loop. Verb handlers mutate session
//! state and return an [`Outcome`]; the loop performs the outcome's
//! effect (reply, enter DATA, run the AUTH dialogue, upgrade to TLS,
//! or close). The mail transaction bundles the envelope with the
//! message handler obtained for it, so "an envelope exists" and "a
//! handler exists" cannot drift apart.

use std::{net::SocketAddr, sync::Arc};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::{
    auth::{AuthDialogue, AuthOutcome},
    command::{self, Command, MailParameters, Spec},
    connection::Connection,
    data::DataReceiver,
    error::{ConnectionError, SessionError},
    handler::{
        AuthValidator, MessageHandler, MessageHandlerFactory, SessionIdSource, SessionInfo,
    },
    incoming, internal, outgoing,
    options::ServerOptions,
    reply::Reply,
    server::Signal,
};

/// Collaborators shared by every session of a server.
pub(crate) struct Shared {
    pub handler_factory: Arc<dyn MessageHandlerFactory>,
    pub auth_validator: Option<Arc<dyn AuthValidator>>,
    pub session_ids: Arc<dyn SessionIdSource>,
    pub tls_acceptor: Option<TlsAcceptor>,
}

/// The envelope under construction plus the handler consuming it.
struct Transaction {
    handler: Box<dyn MessageHandler>,
    recipients: Vec<crate::address::Mailbox>,
    #[allow(dead_code, reason = "reverse path and parameters are kept for collaborator access")]
    reverse_path: Option<crate::address::Mailbox>,
    #[allow(dead_code, reason = "reverse path and parameters are kept for collaborator access")]
    params: MailParameters,
}

/// What a verb handler asks the loop to do after it ran.
enum Outcome {
    Reply(Reply),
    BeginData(Reply),
    BeginAuth {
        mechanism: String,
        initial: Option<String>,
    },
    UpgradeTls,
    Close(Reply),
}

enum LineEvent {
    Line(Vec<u8>),
    TooLong,
    Timeout,
    Closed,
}

pub(crate) struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    options: Arc<ServerOptions>,
    shared: Arc<Shared>,
    connection: Connection<Stream>,
    info: SessionInfo,
    transaction: Option<Transaction>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub(crate) fn new(
        stream: Stream,
        peer: SocketAddr,
        options: Arc<ServerOptions>,
        shared: Arc<Shared>,
    ) -> Self {
        let id = shared.session_ids.next();

        Self {
            connection: Connection::new(stream, options.max_line_length),
            info: SessionInfo {
                id,
                peer,
                remote_host: None,
                helo_host: None,
                extended: false,
                tls_active: false,
                authenticated: None,
            },
            transaction: None,
            options,
            shared,
        }
    }

    /// Drive the session from greeting to close. On every exit path the
    /// pending transaction (if any) is aborted and the socket shut down
    /// exactly once.
    pub(crate) async fn run(
        mut self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!("Session {} connected from {}", self.info.id, self.info.peer);

        let result = self.run_inner(&mut shutdown).await;

        if let Some(mut transaction) = self.transaction.take() {
            transaction.handler.aborted().await;
        }
        self.connection.shutdown().await;

        internal!("Session {} closed", self.info.id);
        result
    }

    async fn run_inner(
        &mut self,
        shutdown: &mut tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        self.send(&Reply::greeting(
            &self.options.host_name,
            &self.options.software_name,
        ))
        .await?;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let _ = self
                        .send(&Reply::shutting_down(&self.options.host_name))
                        .await;
                    return Ok(());
                }

                event = self.next_line() => {
                    match event? {
                        LineEvent::Closed => return Ok(()),
                        LineEvent::Timeout => {
                            let _ = self.send(&Reply::timeout()).await;
                            return Ok(());
                        }
                        LineEvent::TooLong => {
                            self.send(&Reply::line_too_long()).await?;
                        }
                        LineEvent::Line(line) => {
                            if self.handle_line(line).await? {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Read the next command line, bounded by the idle timeout. The
    /// timer covers the whole line and resets with each one.
    async fn next_line(&mut self) -> Result<LineEvent, SessionError> {
        match tokio::time::timeout(
            self.options.connection_timeout(),
            self.connection.read_line(),
        )
        .await
        {
            Err(_) => Ok(LineEvent::Timeout),
            Ok(Ok(line)) => Ok(LineEvent::Line(line)),
            Ok(Err(ConnectionError::Closed)) => Ok(LineEvent::Closed),
            Ok(Err(ConnectionError::LineTooLong(_))) => Ok(LineEvent::TooLong),
            Ok(Err(err)) => Err(err.into()),
        }
    }

    /// Dispatch one command line. Returns `true` when the session
    /// should close.
    async fn handle_line(&mut self, line: Vec<u8>) -> Result<bool, SessionError> {
        let Ok(line) = String::from_utf8(line) else {
            self.send(&Reply::command_unrecognized()).await?;
            return Ok(false);
        };

        let (verb, args) = command::split_verb(&line);
        let Some(spec) = command::lookup(verb) else {
            incoming!("{line}");
            self.send(&Reply::command_unrecognized()).await?;
            return Ok(false);
        };

        if let Some(refusal) = self.gate(spec) {
            incoming!("{verb}");
            self.send(&refusal).await?;
            return Ok(false);
        }

        let command = match Command::parse(spec, args) {
            Ok(command) => command,
            Err(command::CommandError::Unknown) => {
                self.send(&Reply::command_unrecognized()).await?;
                return Ok(false);
            }
            Err(command::CommandError::Syntax(_)) => {
                self.send(&Reply::syntax_error("")).await?;
                return Ok(false);
            }
            Err(command::CommandError::UnsupportedParameter(param)) => {
                self.send(&Reply::parameter_not_implemented(&param)).await?;
                return Ok(false);
            }
        };

        incoming!("{command}");

        let outcome = self.dispatch(command).await;
        match outcome {
            Outcome::Reply(reply) => {
                self.send(&reply).await?;
                Ok(false)
            }
            Outcome::Close(reply) => {
                self.send(&reply).await?;
                Ok(true)
            }
            Outcome::BeginData(reply) => {
                self.send(&reply).await?;
                self.run_data().await
            }
            Outcome::BeginAuth { mechanism, initial } => self.run_auth(&mechanism, initial).await,
            Outcome::UpgradeTls => self.run_starttls().await,
        }
    }

    /// Policy gates, checked before the argument parser runs: TLS
    /// first (so STARTTLS is reachable), then authentication, then the
    /// pre-HELO restriction.
    fn gate(&self, spec: &Spec) -> Option<Reply> {
        if self.options.require_tls && !self.info.tls_active && !spec.tls_exempt {
            return Some(Reply::tls_required());
        }

        if self.options.require_auth
            && self.shared.auth_validator.is_some()
            && self.info.authenticated.is_none()
            && !spec.auth_exempt
        {
            return Some(Reply::auth_required());
        }

        if !spec.pre_helo && self.info.helo_host.is_none() {
            return Some(Reply::bad_sequence());
        }

        None
    }

    async fn dispatch(&mut self, command: Command) -> Outcome {
        match command {
            Command::Helo(host) => self.helo(host, false).await,
            Command::Ehlo(host) => self.helo(host, true).await,
            Command::MailFrom {
                reverse_path,
                params,
            } => self.mail(reverse_path, params).await,
            Command::RcptTo { forward_path } => self.rcpt(forward_path).await,
            Command::Data => self.data(),
            Command::Rset => {
                self.abort_transaction().await;
                Outcome::Reply(Reply::ok())
            }
            Command::Noop => Outcome::Reply(Reply::ok()),
            Command::Quit => {
                self.abort_transaction().await;
                Outcome::Close(Reply::bye(&self.options.host_name))
            }
            Command::StartTls { has_argument } => self.starttls(has_argument),
            Command::Auth { mechanism, initial } => self.auth(mechanism, initial),
            Command::Vrfy(_) => Outcome::Reply(if self.options.enable_vrfy {
                Reply::vrfy_unverified()
            } else {
                Reply::not_implemented()
            }),
            Command::Expn(_) => Outcome::Reply(if self.options.enable_expn {
                Reply::new(252, "2.1.5 Cannot expand the list, but will accept message")
            } else {
                Reply::not_implemented()
            }),
            Command::Help => Outcome::Reply(Reply::help(
                "HELO EHLO MAIL RCPT DATA RSET NOOP QUIT STARTTLS AUTH VRFY HELP",
            )),
        }
    }

    /// HELO/EHLO resets any open transaction and re-identifies the
    /// client.
    async fn helo(&mut self, host: String, extended: bool) -> Outcome {
        self.abort_transaction().await;
        self.info.helo_host = Some(host);
        self.info.extended = extended;

        if !extended {
            return Outcome::Reply(Reply::new(250, self.options.host_name.clone()));
        }

        let mut reply = Reply::new(250, self.options.host_name.clone());

        if self.options.eight_bit_mime {
            reply.push("8BITMIME");
        }
        if self.options.max_message_size > 0 {
            reply.push(format!("SIZE {}", self.options.max_message_size));
        } else {
            reply.push("SIZE");
        }
        if self.options.enable_tls && !self.options.hide_tls && !self.info.tls_active {
            reply.push("STARTTLS");
        }
        if let Some(validator) = &self.shared.auth_validator {
            let mechanisms = validator
                .mechanisms()
                .iter()
                .map(|mechanism| mechanism.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            reply.push(format!("AUTH {mechanisms}"));
        }
        reply.push("PIPELINING");
        reply.push("ENHANCEDSTATUSCODES");
        reply.push("OK");

        Outcome::Reply(reply)
    }

    async fn mail(
        &mut self,
        reverse_path: Option<crate::address::Mailbox>,
        params: MailParameters,
    ) -> Outcome {
        if self.transaction.is_some() {
            return Outcome::Reply(Reply::bad_sequence());
        }

        // RFC 1870: reject a declared size over the advertised maximum
        if self.options.max_message_size > 0
            && let Some(declared) = params.size
            && declared > self.options.max_message_size
        {
            return Outcome::Reply(Reply::size_exceeded());
        }

        let mut handler = self.shared.handler_factory.create(&self.info);
        match handler.from(reverse_path.as_ref()).await {
            Err(rejection) => {
                handler.aborted().await;
                Outcome::Reply(rejection.into_reply(Reply::rejected()))
            }
            Ok(()) => {
                self.transaction = Some(Transaction {
                    handler,
                    recipients: Vec::new(),
                    reverse_path,
                    params,
                });
                Outcome::Reply(Reply::mail_ok())
            }
        }
    }

    async fn rcpt(&mut self, forward_path: crate::address::Mailbox) -> Outcome {
        let max_recipients = self.options.max_recipients;
        let Some(transaction) = self.transaction.as_mut() else {
            return Outcome::Reply(Reply::bad_sequence());
        };

        if transaction.recipients.len() >= max_recipients {
            return Outcome::Reply(Reply::too_many_recipients());
        }

        match transaction.handler.recipient(&forward_path).await {
            Err(rejection) => Outcome::Reply(rejection.into_reply(Reply::rejected())),
            Ok(()) => {
                if !transaction.recipients.contains(&forward_path) {
                    transaction.recipients.push(forward_path);
                }
                Outcome::Reply(Reply::rcpt_ok())
            }
        }
    }

    fn data(&self) -> Outcome {
        match &self.transaction {
            Some(transaction) if !transaction.recipients.is_empty() => {
                Outcome::BeginData(Reply::start_mail_input())
            }
            _ => Outcome::Reply(Reply::bad_sequence()),
        }
    }

    fn starttls(&self, has_argument: bool) -> Outcome {
        if !self.options.enable_tls || self.shared.tls_acceptor.is_none() {
            return Outcome::Reply(Reply::tls_unavailable());
        }
        if self.info.tls_active || has_argument {
            return Outcome::Reply(Reply::bad_sequence());
        }

        Outcome::UpgradeTls
    }

    fn auth(&self, mechanism: String, initial: Option<String>) -> Outcome {
        if self.shared.auth_validator.is_none() {
            return Outcome::Reply(Reply::new(530, "5.7.0 Authentication not available"));
        }
        if self.info.authenticated.is_some() || self.transaction.is_some() {
            return Outcome::Reply(Reply::bad_sequence());
        }

        Outcome::BeginAuth { mechanism, initial }
    }

    /// DATA phase. The transaction is consumed whichever way it ends.
    async fn run_data(&mut self) -> Result<bool, SessionError> {
        let Some(mut transaction) = self.transaction.take() else {
            // data() only emits BeginData with a populated transaction
            self.send(&Reply::bad_sequence()).await?;
            return Ok(false);
        };

        let receiver = DataReceiver {
            host_name: &self.options.host_name,
            software_name: &self.options.software_name,
            insert_received_header: self.options.insert_received_headers,
            timeout: self.options.connection_timeout(),
            info: &self.info,
            first_recipient: &transaction.recipients[0],
        };

        match receiver
            .receive(&mut self.connection, transaction.handler.as_mut())
            .await
        {
            Ok(reply) => {
                self.send(&reply).await?;
                Ok(false)
            }
            Err(SessionError::Connection(ConnectionError::Timeout)) => {
                let _ = self.send(&Reply::timeout()).await;
                Ok(true)
            }
            Err(SessionError::Connection(ConnectionError::Closed)) => Ok(true),
            Err(err) => Err(err),
        }
    }

    /// SASL exchange. No other command is interpreted until it ends.
    async fn run_auth(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<bool, SessionError> {
        let Some(validator) = self.shared.auth_validator.clone() else {
            self.send(&Reply::bad_sequence()).await?;
            return Ok(false);
        };

        let dialogue = AuthDialogue {
            validator: validator.as_ref(),
            host_name: &self.options.host_name,
            timeout: self.options.connection_timeout(),
        };

        match dialogue.run(&mut self.connection, mechanism, initial).await {
            Ok(AuthOutcome::Success { identity }) => {
                internal!("Session {} authenticated as {identity}", self.info.id);
                self.info.authenticated = Some(identity);
                self.send(&Reply::auth_successful()).await?;
                Ok(false)
            }
            Ok(AuthOutcome::Failure(reply)) => {
                self.send(&reply).await?;
                Ok(false)
            }
            Err(SessionError::Connection(ConnectionError::Timeout)) => {
                let _ = self.send(&Reply::timeout()).await;
                Ok(true)
            }
            Err(SessionError::Connection(ConnectionError::Closed)) => Ok(true),
            Err(err) => Err(err),
        }
    }

    /// STARTTLS: 220, injection check, handshake, session reset.
    async fn run_starttls(&mut self) -> Result<bool, SessionError> {
        self.send(&Reply::ready_to_start_tls()).await?;

        // RFC 3207 Section 4.1: plaintext pipelined past STARTTLS is an
        // injection attempt; tear the connection down.
        if self.connection.buffered() > 0 {
            internal!(
                level = WARN,
                "Session {}: plaintext after STARTTLS, closing",
                self.info.id
            );
            return Err(SessionError::CommandInjection);
        }

        let Some(acceptor) = self.shared.tls_acceptor.clone() else {
            // starttls() already verified this; only reachable if the
            // configuration changed under us, which it cannot
            return Err(SessionError::Tls(crate::error::TlsError::Handshake(
                "no TLS acceptor configured".to_string(),
            )));
        };

        if let Err(err) = self.connection.upgrade(&acceptor).await {
            internal!(level = WARN, "Session {}: {err}", self.info.id);
            return Ok(true);
        }

        // RFC 3207 Section 4.2: back to initial state, forget
        // everything learned in plaintext
        self.abort_transaction().await;
        self.info.helo_host = None;
        self.info.authenticated = None;
        self.info.extended = false;
        self.info.tls_active = true;

        internal!("Session {} upgraded to TLS", self.info.id);
        Ok(false)
    }

    async fn abort_transaction(&mut self) {
        if let Some(mut transaction) = self.transaction.take() {
            transaction.handler.aborted().await;
        }
    }

    async fn send(&mut self, reply: &Reply) -> Result<(), SessionError> {
        outgoing!("{reply}");
        self.connection.send(reply).await?;
        Ok(())
    }
}

/// Over-capacity path: greet with 421 and close without a session.
pub(crate) async fn refuse_over_capacity<Stream>(stream: Stream, options: &ServerOptions)
where
    Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    let mut connection = Connection::new(stream, options.max_line_length);
    let _ = connection
        .send(&Reply::too_many_connections(&options.host_name))
        .await;
    connection.shutdown().await;
}
