//! Tracing setup and the protocol trace macros.
//!
//! Wire traffic is logged as `tracing` events carrying a `direction`
//! field (`incoming`, `outgoing`, or `internal`), so subscribers can
//! filter or format the two sides of a conversation without parsing
//! message text. [`init`] installs a compact subscriber for embedders
//! that do not bring their own; filtering is controlled through the
//! `POSTBOX_LOG` environment variable using the usual directive syntax
//! (for example `POSTBOX_LOG=postbox=debug`).

use tracing_subscriber::EnvFilter;

/// Emit one direction-tagged protocol event. The building block for
/// [`incoming!`](crate::incoming), [`outgoing!`](crate::outgoing), and
/// [`internal!`](crate::internal).
#[macro_export]
macro_rules! protocol_event {
    ($direction:literal, $level:expr, $($arg:tt)+) => {
        $crate::tracing::event!(
            target: "postbox",
            $level,
            direction = $direction,
            $($arg)+
        )
    };
}

/// A line or event received from the client.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::protocol_event!("incoming", $crate::tracing::Level::$level, $($arg)+)
    };

    ($($arg:tt)+) => {
        $crate::protocol_event!("incoming", $crate::tracing::Level::TRACE, $($arg)+)
    };
}

/// A reply sent to the client.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::protocol_event!("outgoing", $crate::tracing::Level::$level, $($arg)+)
    };

    ($($arg:tt)+) => {
        $crate::protocol_event!("outgoing", $crate::tracing::Level::TRACE, $($arg)+)
    };
}

/// Server-side bookkeeping not tied to either direction of the wire.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::protocol_event!("internal", $crate::tracing::Level::$level, $($arg)+)
    };

    ($($arg:tt)+) => {
        $crate::protocol_event!("internal", $crate::tracing::Level::TRACE, $($arg)+)
    };
}

/// Install a compact global subscriber honoring `POSTBOX_LOG`.
///
/// Convenience for binaries that have no subscriber of their own;
/// embedders with an existing `tracing` pipeline should skip this.
/// Calling it twice (or alongside another global subscriber) is a
/// no-op, not an error.
pub fn init() {
    let fallback = if cfg!(debug_assertions) {
        "postbox=trace"
    } else {
        "postbox=info"
    };
    let filter =
        EnvFilter::try_from_env("POSTBOX_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .try_init();
}
