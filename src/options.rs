//! Server configuration.
//!
//! [`ServerOptions`] is a flat, immutable record assembled before
//! [`crate::Server::start`] and never mutated afterwards. It is
//! deserializable so embedders can load it from their own config files,
//! and every field has a builder-style `with_*` method for assembling it
//! in code.

use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    time::Duration,
};

use serde::Deserialize;

/// Paths to the PEM certificate chain and private key used for STARTTLS.
#[derive(Clone, Debug, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerOptions {
    /// Identity announced in the greeting, EHLO response, and Received
    /// headers.
    #[serde(default = "default_host_name")]
    pub host_name: String,

    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Port to listen on. 0 asks the OS for an ephemeral port; the
    /// allocated port is available from the server once started.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Software identifier appended to the greeting banner.
    #[serde(default = "default_software_name")]
    pub software_name: String,

    /// Master switch for STARTTLS. When false the command answers 454
    /// regardless of `tls`.
    #[serde(default)]
    pub enable_tls: bool,

    /// Certificate material for STARTTLS. Required when `enable_tls`.
    #[serde(default)]
    pub tls: Option<TlsContext>,

    /// Keep STARTTLS working but leave it out of the EHLO capability
    /// list.
    #[serde(default)]
    pub hide_tls: bool,

    /// Refuse mail commands until the session has been upgraded to TLS.
    #[serde(default)]
    pub require_tls: bool,

    /// Refuse mail commands until the client has authenticated.
    #[serde(default)]
    pub require_auth: bool,

    /// Prepend a Received trace header to every accepted message.
    #[serde(default = "default_true")]
    pub insert_received_headers: bool,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle window per command line, in milliseconds. The timer resets
    /// after every complete line.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Maximum declared message size (RFC 1870). 0 advertises a bare
    /// SIZE and enforces nothing.
    #[serde(default)]
    pub max_message_size: usize,

    /// Longest accepted line in octets, excluding CRLF (RFC 5321
    /// Section 4.5.3.1).
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Advertise 8BITMIME in the EHLO response. `BODY=8BITMIME` is
    /// accepted as a MAIL parameter either way.
    #[serde(default)]
    pub eight_bit_mime: bool,

    /// VRFY answers 252 when enabled, 502 otherwise.
    #[serde(default = "default_true")]
    pub enable_vrfy: bool,

    /// EXPN answers 252 when enabled, 502 otherwise.
    #[serde(default)]
    pub enable_expn: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host_name: default_host_name(),
            bind_address: default_bind_address(),
            port: default_port(),
            backlog: default_backlog(),
            software_name: default_software_name(),
            enable_tls: false,
            tls: None,
            hide_tls: false,
            require_tls: false,
            require_auth: false,
            insert_received_headers: true,
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            max_recipients: default_max_recipients(),
            max_message_size: 0,
            max_line_length: default_max_line_length(),
            eight_bit_mime: false,
            enable_vrfy: true,
            enable_expn: false,
        }
    }
}

impl ServerOptions {
    #[must_use]
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    #[must_use]
    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = bind_address;
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub const fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    #[must_use]
    pub fn with_software_name(mut self, software_name: impl Into<String>) -> Self {
        self.software_name = software_name.into();
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.enable_tls = true;
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub const fn with_hide_tls(mut self, hide_tls: bool) -> Self {
        self.hide_tls = hide_tls;
        self
    }

    #[must_use]
    pub const fn with_require_tls(mut self, require_tls: bool) -> Self {
        self.require_tls = require_tls;
        self
    }

    #[must_use]
    pub const fn with_require_auth(mut self, require_auth: bool) -> Self {
        self.require_auth = require_auth;
        self
    }

    #[must_use]
    pub const fn with_received_headers(mut self, insert: bool) -> Self {
        self.insert_received_headers = insert;
        self
    }

    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    #[must_use]
    pub const fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub const fn with_max_recipients(mut self, max_recipients: usize) -> Self {
        self.max_recipients = max_recipients;
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    #[must_use]
    pub const fn with_eight_bit_mime(mut self, eight_bit_mime: bool) -> Self {
        self.eight_bit_mime = eight_bit_mime;
        self
    }

    #[must_use]
    pub const fn with_vrfy(mut self, enable_vrfy: bool) -> Self {
        self.enable_vrfy = enable_vrfy;
        self
    }

    #[must_use]
    pub const fn with_expn(mut self, enable_expn: bool) -> Self {
        self.enable_expn = enable_expn;
        self
    }

    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

fn default_host_name() -> String {
    "localhost".to_string()
}

const fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    25
}

const fn default_backlog() -> u32 {
    50
}

fn default_software_name() -> String {
    concat!("postbox ", env!("CARGO_PKG_VERSION")).to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_max_connections() -> usize {
    1000
}

const fn default_connection_timeout_ms() -> u64 {
    60_000
}

const fn default_max_recipients() -> usize {
    1000
}

const fn default_max_line_length() -> usize {
    998
}
