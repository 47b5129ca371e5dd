use std::error::Error;
use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use appstats_config::Config;
use appstats_system::{Controller, Receiver, Service, Shutdown};
use axum::http::{HeaderValue, header};
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;

use crate::constants::{self, TCP_LISTEN_BACKLOG};
use crate::middlewares::{self, CatchPanicLayer};
use crate::service::ServiceState;
use crate::services::ServerError;
use crate::statsd::ServerCounters;

/// Build the axum application with all routes and middleware.
pub(crate) fn make_app(service: ServiceState) -> axum::Router {
    // Requests pass the layers from top to bottom, responses from bottom to top.
    let middleware = ServiceBuilder::new()
        .layer(CatchPanicLayer::custom(middlewares::handle_panic))
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static(constants::SERVER),
        ))
        .layer(middlewares::trace_http_layer())
        .layer(TimeoutLayer::new(service.config().query_timeout()));

    crate::endpoints::routes()
        .layer(middleware)
        .with_state(service)
}

fn listen(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }?;

    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(TCP_LISTEN_BACKLOG)?)
}

/// Resolves once the graceful shutdown period has run out.
async fn shutdown_deadline() {
    let Shutdown { timeout } = Controller::shutdown_handle().notified().await;
    if let Some(timeout) = timeout {
        tokio::time::sleep(timeout).await;
    }
}

/// HTTP server service.
///
/// Hosts the query API. On [`Shutdown`] the server stops accepting connections and waits for open
/// requests until the shutdown timeout.
#[derive(Debug)]
pub struct HttpServer {
    service: ServiceState,
    listener: TcpListener,
}

impl HttpServer {
    /// Binds the HTTP socket on the configured address.
    pub fn new(config: Arc<Config>, service: ServiceState) -> Result<Self, ServerError> {
        let listener = listen(config.http_listen_addr())?;
        Ok(Self { service, listener })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Service for HttpServer {
    type Interface = ();

    fn spawn_handler(self, _rx: Receiver<Self::Interface>) -> JoinHandle<()> {
        tokio::spawn(async move {
            appstats_log::info!("spawning http server");
            if let Ok(addr) = self.local_addr() {
                appstats_log::info!("  listening on http://{addr}/");
            }
            appstats_statsd::metric!(counter(ServerCounters::ServerStarting) += 1);

            let Self { service, listener } = self;
            let app = make_app(service);

            let mut shutdown = Controller::shutdown_handle();
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.notified().await;
                    appstats_log::info!("shutting down http server");
                })
                .into_future();

            tokio::select! {
                result = server => {
                    if let Err(err) = result {
                        appstats_log::error!(error = &err as &dyn Error, "http server failed");
                    }
                }
                _ = shutdown_deadline() => {
                    appstats_log::warn!("shutdown timeout reached, closing open http connections");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::endpoints::tests::test_state;

    #[tokio::test]
    async fn test_serves_healthcheck() {
        let config = Config::from_json_value(serde_json::json!({
            "listen": {"host": "127.0.0.1", "http_port": 0}
        }))
        .unwrap();

        let (state, _rx) = test_state();
        let server = HttpServer::new(Arc::new(config), state).unwrap();
        let addr = server.local_addr().unwrap();
        server.start(1);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /api/healthcheck/live HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains(constants::SERVER));
        assert!(response.ends_with(r#"{"is_healthy":true}"#));
    }
}
