//! Accept loop and admission control.
//!
//! One listener task accepts connections and hands each socket to its
//! own session task. The admission counter is incremented before the
//! hand-off and released by a drop guard, so a panicking session still
//! gives its slot back. Connections over the cap get the 421 path
//! instead of a session.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures_util::future::join_all;
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};

use crate::{
    internal,
    options::ServerOptions,
    server::Signal,
    session::{self, Session, Shared},
};

/// How long in-flight sessions get to finish their current command
/// after shutdown is signalled.
const SHUTDOWN_WINDOW: Duration = Duration::from_secs(5);

/// Releases one admission slot when the session task ends, however it
/// ends.
struct Admission(Arc<AtomicUsize>);

impl Drop for Admission {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct Listener {
    pub options: Arc<ServerOptions>,
    pub shared: Arc<Shared>,
    pub active: Arc<AtomicUsize>,
}

impl Listener {
    pub(crate) async fn serve(self, listener: TcpListener, signal: broadcast::Sender<Signal>) {
        let mut shutdown = signal.subscribe();
        let mut sessions: Vec<JoinHandle<()>> = Vec::new();

        internal!(
            level = INFO,
            "Listening on {}",
            listener
                .local_addr()
                .map_or_else(|_| "<unknown>".to_string(), |addr| addr.to_string())
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    internal!(level = INFO, "Shutdown signalled, finishing sessions ...");
                    break;
                }

                connection = listener.accept() => {
                    match connection {
                        Err(err) => {
                            internal!(level = ERROR, "Accept failed: {err}");
                        }
                        Ok((stream, peer)) => {
                            sessions.retain(|handle| !handle.is_finished());
                            sessions.push(self.admit(stream, peer, &signal));
                        }
                    }
                }
            }
        }

        drop(listener);

        let aborts: Vec<_> = sessions.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(SHUTDOWN_WINDOW, join_all(sessions))
            .await
            .is_err()
        {
            internal!(
                level = WARN,
                "Shutdown window elapsed, interrupting remaining sessions"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }

    fn admit(
        &self,
        stream: tokio::net::TcpStream,
        peer: std::net::SocketAddr,
        signal: &broadcast::Sender<Signal>,
    ) -> JoinHandle<()> {
        tracing::debug!("Connection received from {peer}");

        let options = Arc::clone(&self.options);
        let active = Arc::clone(&self.active);

        if active.fetch_add(1, Ordering::SeqCst) >= options.max_connections {
            let admission = Admission(active);
            return tokio::spawn(async move {
                let _admission = admission;
                session::refuse_over_capacity(stream, &options).await;
            });
        }

        let session = Session::new(stream, peer, options, Arc::clone(&self.shared));
        let receiver = signal.subscribe();
        let admission = Admission(active);

        tokio::spawn(async move {
            let _admission = admission;
            if let Err(err) = session.run(receiver).await {
                internal!(level = ERROR, "Session error: {err}");
            }
        })
    }
}
