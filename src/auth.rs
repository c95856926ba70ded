//! SASL authentication dialogue (RFC 4954).
//!
//! The engine owns the mechanism sub-state machines for PLAIN, LOGIN,
//! and CRAM-MD5; decoded credentials are handed to the embedder's
//! [`AuthValidator`] for verification. While a dialogue is in progress
//! no other command is interpreted: every line the client sends belongs
//! to the exchange, and `*` aborts it.

use core::fmt::{self, Display, Formatter};
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    connection::Connection,
    error::{ConnectionError, SessionError},
    handler::{AuthValidator, Credentials},
    reply::Reply,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
    CramMd5,
}

impl Mechanism {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM-MD5" => Some(Self::CramMd5),
            _ => None,
        }
    }
}

impl Display for Mechanism {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// How an authentication exchange ended. Timeouts and I/O failures
/// surface as `SessionError` instead.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Verified; the session records the identity and answers 235.
    Success { identity: String },
    /// Refused or aborted; the reply to send (535, 501, 504).
    Failure(Reply),
}

/// One SASL exchange, bound to the session's validator and timeouts.
pub(crate) struct AuthDialogue<'a> {
    pub validator: &'a dyn AuthValidator,
    pub host_name: &'a str,
    pub timeout: Duration,
}

impl AuthDialogue<'_> {
    pub async fn run<Stream>(
        &self,
        connection: &mut Connection<Stream>,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<AuthOutcome, SessionError>
    where
        Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    {
        let Some(mechanism) = Mechanism::from_name(mechanism) else {
            return Ok(AuthOutcome::Failure(Reply::unrecognized_auth_type()));
        };
        if !self.validator.mechanisms().contains(&mechanism) {
            return Ok(AuthOutcome::Failure(Reply::unrecognized_auth_type()));
        }

        match mechanism {
            Mechanism::Plain => self.plain(connection, initial).await,
            Mechanism::Login => self.login(connection, initial).await,
            Mechanism::CramMd5 => self.cram_md5(connection, initial).await,
        }
    }

    /// RFC 4616: single base64 blob `authzid NUL authcid NUL password`.
    async fn plain<Stream>(
        &self,
        connection: &mut Connection<Stream>,
        initial: Option<String>,
    ) -> Result<AuthOutcome, SessionError>
    where
        Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    {
        let encoded = match initial {
            Some(encoded) => encoded,
            None => {
                connection.send(&Reply::challenge("")).await?;
                match self.read_response(connection).await? {
                    Response::Abort => return Ok(AuthOutcome::Failure(Reply::auth_aborted())),
                    Response::Data(data) => data,
                }
            }
        };

        let Some(decoded) = decode(&encoded) else {
            return Ok(AuthOutcome::Failure(Reply::cannot_decode()));
        };

        let mut parts = decoded.split('\0');
        let (Some(authzid), Some(authcid), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Ok(AuthOutcome::Failure(Reply::cannot_decode()));
        };

        self.validate(Credentials::Plain {
            authzid: authzid.to_string(),
            authcid: authcid.to_string(),
            password: password.to_string(),
        })
        .await
    }

    /// The venerable two-prompt exchange: `Username:` then `Password:`.
    async fn login<Stream>(
        &self,
        connection: &mut Connection<Stream>,
        initial: Option<String>,
    ) -> Result<AuthOutcome, SessionError>
    where
        Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    {
        let username = match initial {
            Some(encoded) => encoded,
            None => {
                connection.send(&Reply::challenge("VXNlcm5hbWU6")).await?;
                match self.read_response(connection).await? {
                    Response::Abort => return Ok(AuthOutcome::Failure(Reply::auth_aborted())),
                    Response::Data(data) => data,
                }
            }
        };
        let Some(username) = decode(&username) else {
            return Ok(AuthOutcome::Failure(Reply::cannot_decode()));
        };

        connection.send(&Reply::challenge("UGFzc3dvcmQ6")).await?;
        let password = match self.read_response(connection).await? {
            Response::Abort => return Ok(AuthOutcome::Failure(Reply::auth_aborted())),
            Response::Data(data) => data,
        };
        let Some(password) = decode(&password) else {
            return Ok(AuthOutcome::Failure(Reply::cannot_decode()));
        };

        self.validate(Credentials::Login { username, password }).await
    }

    /// RFC 2195: challenge-response with an HMAC-MD5 digest. The
    /// validator performs the HMAC check; the engine only generates the
    /// challenge and splits the response.
    async fn cram_md5<Stream>(
        &self,
        connection: &mut Connection<Stream>,
        initial: Option<String>,
    ) -> Result<AuthOutcome, SessionError>
    where
        Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    {
        // CRAM-MD5 has no initial response by definition
        if initial.is_some() {
            return Ok(AuthOutcome::Failure(Reply::cannot_decode()));
        }

        let challenge = format!(
            "<{}@{}>",
            uuid::Uuid::new_v4().simple(),
            self.host_name
        );
        connection
            .send(&Reply::challenge(BASE64.encode(&challenge)))
            .await?;

        let response = match self.read_response(connection).await? {
            Response::Abort => return Ok(AuthOutcome::Failure(Reply::auth_aborted())),
            Response::Data(data) => data,
        };
        let Some(decoded) = decode(&response) else {
            return Ok(AuthOutcome::Failure(Reply::cannot_decode()));
        };

        let Some((username, digest)) = decoded.rsplit_once(' ') else {
            return Ok(AuthOutcome::Failure(Reply::cannot_decode()));
        };
        if digest.len() != 32 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(AuthOutcome::Failure(Reply::cannot_decode()));
        }

        self.validate(Credentials::CramMd5 {
            username: username.to_string(),
            challenge,
            digest: digest.to_ascii_lowercase(),
        })
        .await
    }

    async fn validate(&self, credentials: Credentials) -> Result<AuthOutcome, SessionError> {
        Ok(match self.validator.validate(credentials).await {
            Ok(identity) => AuthOutcome::Success { identity },
            Err(rejection) => AuthOutcome::Failure(rejection.into_reply(Reply::auth_failed())),
        })
    }

    async fn read_response<Stream>(
        &self,
        connection: &mut Connection<Stream>,
    ) -> Result<Response, SessionError>
    where
        Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    {
        let line = tokio::time::timeout(self.timeout, connection.read_line())
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        let line = String::from_utf8_lossy(&line).trim().to_string();
        if line == "*" {
            return Ok(Response::Abort);
        }
        Ok(Response::Data(line))
    }
}

enum Response {
    Abort,
    Data(String),
}

/// Decode a base64 client response into UTF-8. `=` stands for an empty
/// response (RFC 4954 Section 4).
fn decode(encoded: &str) -> Option<String> {
    let encoded = encoded.trim();
    if encoded == "=" {
        return Some(String::new());
    }

    BASE64
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}
