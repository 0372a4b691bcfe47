//! Server accept loop and graceful shutdown.
//!
//! Contains the runtime infrastructure between a TCP listener and a pool's
//! [`Dispatcher`]. Kept apart from `main()` so that listeners can be driven
//! from tests without process-level concerns like signal handling.

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::dispatch::{Dispatcher, Forward};

/// Accepts connections on `listener` and serves every request through
/// `dispatcher`, one task per connection.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. Requests on already-spawned tasks run to completion.
pub async fn serve<F>(
    listener: TcpListener,
    dispatcher: Dispatcher<F>,
    shutdown: impl Future<Output = ()>,
) where
    F: Forward,
{
    tokio::pin!(shutdown);

    if let Ok(addr) = listener.local_addr() {
        info!(
            %addr,
            strategy = %dispatcher.pool().strategy(),
            backends = dispatcher.pool().len(),
            "load balancer listening"
        );
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let dispatcher = dispatcher.clone();

                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let dispatcher = dispatcher.clone();
                        async move {
                            let resp = dispatcher.dispatch(req, client_addr).await;
                            Ok::<_, std::convert::Infallible>(resp)
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
                    _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
                }
            }
            Err(e) => {
                warn!(%e, "failed to register SIGTERM handler, waiting for Ctrl+C only");
                let _ = ctrl_c.await;
                info!("received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}
