pub mod address;
pub mod auth;
pub mod command;
pub mod connection;
mod data;
pub mod error;
pub mod handler;
mod listener;
pub mod logging;
pub mod options;
pub mod reply;
pub mod server;
mod session;

pub use address::Mailbox;
pub use auth::Mechanism;
pub use error::{ConnectionError, ServerError, SessionError, TlsError};
pub use handler::{
    AuthValidator, Credentials, MessageHandler, MessageHandlerFactory, Rejection, SessionIdSource,
    SessionInfo, UuidSessionIds,
};
pub use options::{ServerOptions, TlsContext};
pub use reply::Reply;
pub use server::Server;
pub use tracing;
