use std::sync::LazyLock;
use std::time::Duration;

use tokio::sync::watch;

/// Shutdown request message sent by the [`Controller`] to subscribed services.
///
/// A handler has to ensure that it doesn't take longer than `timeout` to resolve the future.
/// Ideally, open work is persisted or finished in an orderly manner but no new requests are
/// accepted anymore.
///
/// After the timeout the system will shut down regardless of what the receivers of this message
/// do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

type Channel = (watch::Sender<Option<Shutdown>>, watch::Receiver<Option<Shutdown>>);

static SHUTDOWN: LazyLock<Channel> = LazyLock::new(|| watch::channel(None));

/// Notifies a service about an upcoming shutdown.
#[derive(Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Wait for a shutdown.
    ///
    /// This receives all shutdown signals since the [`Controller`] has been started, even before
    /// this shutdown handle has been obtained.
    ///
    /// # Cancellation
    ///
    /// This method is cancellation safe and can be used in `select!`.
    pub async fn notified(&mut self) -> Shutdown {
        loop {
            if let Some(shutdown) = self.0.borrow_and_update().as_ref() {
                return shutdown.clone();
            }

            if self.0.changed().await.is_err() {
                // The sender lives in a static and is never dropped.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Service to start and gracefully stop the system runtime.
///
/// The controller listens for `SIGINT` and `SIGTERM`. The first signal requests a graceful
/// shutdown with the configured timeout, the second one forces an immediate shutdown.
///
/// ### Example
///
/// ```
/// use std::time::Duration;
/// use appstats_system::{Controller, Shutdown};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut shutdown = Controller::shutdown_handle();
/// tokio::spawn(async move {
///     let Shutdown { timeout } = shutdown.notified().await;
///     appstats_log::info!("stopping with timeout {timeout:?}");
/// });
///
/// Controller::shutdown(Some(Duration::from_secs(1)));
/// # }
/// ```
#[derive(Debug)]
pub struct Controller;

impl Controller {
    /// Starts a controller that monitors shutdown signals.
    pub fn start(shutdown_timeout: Duration) {
        tokio::spawn(monitor_shutdown(shutdown_timeout));
    }

    /// Manually initiates the shutdown process of the system.
    pub fn shutdown(timeout: Option<Duration>) {
        SHUTDOWN.0.send_replace(Some(Shutdown { timeout }));
    }

    /// Returns a [handle](ShutdownHandle) to receive shutdown notifications.
    pub fn shutdown_handle() -> ShutdownHandle {
        ShutdownHandle(SHUTDOWN.1.clone())
    }
}

#[cfg(unix)]
async fn monitor_shutdown(timeout: Duration) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sig_int = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(error) => {
            appstats_log::error!(
                error = &error as &dyn std::error::Error,
                "failed to install SIGINT handler"
            );
            return;
        }
    };
    let mut sig_term = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(error) => {
            appstats_log::error!(
                error = &error as &dyn std::error::Error,
                "failed to install SIGTERM handler"
            );
            return;
        }
    };

    let mut graceful = true;
    loop {
        tokio::select! {
            _ = sig_int.recv() => appstats_log::info!("SIGINT received"),
            _ = sig_term.recv() => appstats_log::info!("SIGTERM received"),
        }

        if graceful {
            appstats_log::info!("shutting down gracefully, send the signal again to force");
            Controller::shutdown(Some(timeout));
            graceful = false;
        } else {
            appstats_log::warn!("forcing immediate shutdown");
            Controller::shutdown(None);
            return;
        }
    }
}

#[cfg(not(unix))]
async fn monitor_shutdown(timeout: Duration) {
    if tokio::signal::ctrl_c().await.is_ok() {
        appstats_log::info!("ctrl-c received, shutting down gracefully");
        Controller::shutdown(Some(timeout));
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        appstats_log::warn!("forcing immediate shutdown");
        Controller::shutdown(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_sees_earlier_shutdown() {
        let mut early = Controller::shutdown_handle();
        Controller::shutdown(Some(Duration::from_secs(3)));

        let mut late = Controller::shutdown_handle();

        let expected = Shutdown {
            timeout: Some(Duration::from_secs(3)),
        };
        assert_eq!(early.notified().await, expected);
        assert_eq!(late.notified().await, expected);
    }
}
