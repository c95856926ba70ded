//! Collaborator interfaces the protocol engine consumes.
//!
//! The engine owns the wire protocol; everything with a policy or a
//! side effect is delegated: a [`MessageHandlerFactory`] consumes
//! envelopes and message bytes, an [`AuthValidator`] checks SASL
//! credentials, and a [`SessionIdSource`] names sessions. Factories are
//! shared across sessions and expected to hand out fresh per-session
//! state.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::{address::Mailbox, auth::Mechanism, reply::Reply};

/// A snapshot of per-connection facts exposed to collaborators.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    /// Opaque id, unique per connection.
    pub id: String,
    /// Peer socket address.
    pub peer: SocketAddr,
    /// Canonical peer name, when known. The engine performs no DNS; an
    /// embedder wrapping the listener may fill this in.
    pub remote_host: Option<String>,
    /// Last argument to HELO/EHLO.
    pub helo_host: Option<String>,
    /// True when the client greeted with EHLO rather than HELO.
    pub extended: bool,
    /// Whether STARTTLS has completed on this connection.
    pub tls_active: bool,
    /// Authenticated identity, once SASL succeeds.
    pub authenticated: Option<String>,
}

/// A refusal carried back from a collaborator.
///
/// A bare rejection maps to the default reply for the operation that
/// failed (550 5.7.1 for envelope pieces, 554 5.0.0 for message
/// disposal); a rejection with a reply surfaces that reply verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    reply: Option<Reply>,
}

impl Rejection {
    /// Reject with the operation's default reply.
    #[must_use]
    pub const fn denied() -> Self {
        Self { reply: None }
    }

    /// Reject with a specific SMTP reply.
    #[must_use]
    pub const fn with_reply(reply: Reply) -> Self {
        Self { reply: Some(reply) }
    }

    /// The reply to send, falling back to `default`.
    #[must_use]
    pub fn into_reply(self, default: Reply) -> Reply {
        self.reply.unwrap_or(default)
    }
}

/// Per-transaction message consumer.
///
/// One handler is obtained from the factory when MAIL is accepted and
/// released when the transaction ends (end of DATA, RSET, or session
/// teardown). Exactly one of [`done`](Self::done) or
/// [`aborted`](Self::aborted) is called per handler.
///
/// Callbacks may block on I/O; the engine treats every call as a
/// suspension point.
#[async_trait]
pub trait MessageHandler: Send {
    /// The accepted reverse-path. `None` is the null sender (bounces).
    async fn from(&mut self, _reverse_path: Option<&Mailbox>) -> Result<(), Rejection> {
        Ok(())
    }

    /// A forward-path the client asked to deliver to. Rejecting refuses
    /// this recipient only; the transaction stays open.
    async fn recipient(&mut self, _forward_path: &Mailbox) -> Result<(), Rejection> {
        Ok(())
    }

    /// A chunk of message data, dot-unstuffed, CRLF included. Called
    /// once per line; the engine never buffers the message body.
    async fn data(&mut self, chunk: &[u8]) -> Result<(), Rejection>;

    /// End of message. Accepting yields `250 2.6.0`; a rejection reply
    /// (or the 554 default) is sent otherwise.
    async fn done(&mut self) -> Result<(), Rejection>;

    /// The transaction was discarded: RSET, QUIT, a failed message, or
    /// a dropped connection.
    async fn aborted(&mut self);
}

/// Hands out one [`MessageHandler`] per mail transaction.
pub trait MessageHandlerFactory: Send + Sync {
    fn create(&self, session: &SessionInfo) -> Box<dyn MessageHandler>;
}

/// Decoded SASL credentials, ready for verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    /// RFC 4616 PLAIN. `authzid` is usually empty.
    Plain {
        authzid: String,
        authcid: String,
        password: String,
    },
    Login {
        username: String,
        password: String,
    },
    /// CRAM-MD5: the validator checks `digest` (lowercase hex) against
    /// HMAC-MD5(password, challenge) for the named user.
    CramMd5 {
        username: String,
        challenge: String,
        digest: String,
    },
}

/// Verifies SASL credentials. Present iff AUTH is offered.
#[async_trait]
pub trait AuthValidator: Send + Sync {
    /// Mechanisms to advertise, in order.
    fn mechanisms(&self) -> Vec<Mechanism>;

    /// Check credentials; success returns the authenticated identity.
    async fn validate(&self, credentials: Credentials) -> Result<String, Rejection>;
}

/// Produces session ids. Ids are opaque to the engine.
pub trait SessionIdSource: Send + Sync {
    fn next(&self) -> String;
}

/// Default id source: random v4 UUIDs.
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidSessionIds;

impl SessionIdSource for UuidSessionIds {
    fn next(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}
