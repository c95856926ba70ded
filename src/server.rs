//! Server control surface.
//!
//! A [`Server`] is assembled from [`ServerOptions`] and the embedder's
//! collaborators, then driven through a single-shot lifecycle:
//! `start` binds the socket and spawns the listener task, `stop`
//! signals shutdown and drains in-flight sessions. A stopped server
//! cannot be restarted; build a new one.

use std::{
    net::SocketAddr,
    sync::{Arc, atomic::AtomicUsize},
};

use tokio::{net::TcpSocket, sync::broadcast, task::JoinHandle};

use crate::{
    connection,
    error::ServerError,
    handler::{AuthValidator, MessageHandlerFactory, SessionIdSource, UuidSessionIds},
    internal,
    listener::Listener,
    options::ServerOptions,
    session::Shared,
};

/// Control message fanned out to the listener and every session.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Signal {
    Shutdown,
}

enum State {
    Created,
    Running {
        signal: broadcast::Sender<Signal>,
        task: JoinHandle<()>,
    },
    Stopped,
}

pub struct Server {
    options: Arc<ServerOptions>,
    handler_factory: Option<Arc<dyn MessageHandlerFactory>>,
    auth_validator: Option<Arc<dyn AuthValidator>>,
    session_ids: Arc<dyn SessionIdSource>,
    local_addr: Option<SocketAddr>,
    state: State,
}

impl Server {
    #[must_use]
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options: Arc::new(options),
            handler_factory: None,
            auth_validator: None,
            session_ids: Arc::new(UuidSessionIds),
            local_addr: None,
            state: State::Created,
        }
    }

    /// The message handler factory consuming envelopes and bytes.
    /// Required before `start`.
    #[must_use]
    pub fn with_handler_factory(mut self, factory: impl MessageHandlerFactory + 'static) -> Self {
        self.handler_factory = Some(Arc::new(factory));
        self
    }

    /// Offer AUTH with the given validator.
    #[must_use]
    pub fn with_auth_validator(mut self, validator: impl AuthValidator + 'static) -> Self {
        self.auth_validator = Some(Arc::new(validator));
        self
    }

    /// Replace the default (UUID) session id source.
    #[must_use]
    pub fn with_session_ids(mut self, session_ids: impl SessionIdSource + 'static) -> Self {
        self.session_ids = Arc::new(session_ids);
        self
    }

    /// Bind the socket and spawn the listener task.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` / `Stopped` on lifecycle misuse,
    /// `MissingHandlerFactory` when no factory was supplied, `Bind` on
    /// socket errors, and TLS errors when the configured certificate
    /// material cannot be loaded.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        match self.state {
            State::Running { .. } => return Err(ServerError::AlreadyStarted),
            State::Stopped => return Err(ServerError::Stopped),
            State::Created => {}
        }

        let handler_factory = self
            .handler_factory
            .clone()
            .ok_or(ServerError::MissingHandlerFactory)?;

        let tls_acceptor = if self.options.enable_tls {
            let context = self
                .options
                .tls
                .as_ref()
                .ok_or(ServerError::MissingTlsContext)?;
            Some(connection::build_acceptor(context)?)
        } else {
            None
        };

        let address = SocketAddr::new(self.options.bind_address, self.options.port);
        let socket = match address {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(ServerError::Bind)?;
        socket.set_reuseaddr(true).map_err(ServerError::Bind)?;
        socket.bind(address).map_err(ServerError::Bind)?;
        let listener = socket
            .listen(self.options.backlog)
            .map_err(ServerError::Bind)?;

        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;
        self.local_addr = Some(local_addr);

        let (signal, _) = broadcast::channel(8);
        let task = tokio::spawn(
            Listener {
                options: Arc::clone(&self.options),
                shared: Arc::new(Shared {
                    handler_factory,
                    auth_validator: self.auth_validator.clone(),
                    session_ids: Arc::clone(&self.session_ids),
                    tls_acceptor,
                }),
                active: Arc::new(AtomicUsize::new(0)),
            }
            .serve(listener, signal.clone()),
        );

        internal!(level = INFO, "Server started on {local_addr}");
        self.state = State::Running { signal, task };
        Ok(())
    }

    /// Stop accepting, signal in-flight sessions, and wait for the
    /// listener to drain them (bounded). Idempotent; a never-started
    /// server just becomes unstartable.
    pub async fn stop(&mut self) {
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running { signal, task } => {
                internal!(level = INFO, "Server stopping");
                let _ = signal.send(Signal::Shutdown);
                let _ = task.await;
                internal!(level = INFO, "Server stopped");
            }
            State::Created | State::Stopped => {}
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(&self.state, State::Running { task, .. } if !task.is_finished())
    }

    /// The bound address, once started. With `port = 0` this carries
    /// the OS-allocated port.
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}
