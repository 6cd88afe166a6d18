//! OS termination signals as a stream.
//!
//! ## Unix
//! Yields `"SIGINT"` or `"SIGTERM"` each time one arrives, so a second
//! signal can escalate a graceful shutdown.
//!
//! ## Other platforms
//! Yields `"ctrl-c"` for every [`tokio::signal::ctrl_c`] event.

use futures_util::stream::{self, BoxStream, StreamExt};

/// Installs the signal handlers and returns the stream of signal names.
///
/// # Errors
///
/// Returns the I/O error from handler registration.
#[cfg(unix)]
pub fn signal_stream() -> std::io::Result<BoxStream<'static, &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt())?;
    let sigterm = signal(SignalKind::terminate())?;

    Ok(stream::unfold(
        (sigint, sigterm),
        |(mut sigint, mut sigterm)| async move {
            let name = tokio::select! {
                Some(()) = sigint.recv() => "SIGINT",
                Some(()) = sigterm.recv() => "SIGTERM",
                else => return None,
            };
            Some((name, (sigint, sigterm)))
        },
    )
    .boxed())
}

/// Installs the Ctrl-C handler and returns the stream of signal names.
///
/// # Errors
///
/// Never fails on this platform; the signature matches the Unix variant.
#[cfg(not(unix))]
pub fn signal_stream() -> std::io::Result<BoxStream<'static, &'static str>> {
    Ok(stream::unfold((), |()| async {
        tokio::signal::ctrl_c().await.ok()?;
        Some(("ctrl-c", ()))
    })
    .boxed())
}
