//! Unix socket transport for the REST adapter

use axum::Router;
use hyper::server::accept;
use std::future::Future;
use std::path::Path;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tracing::{info, warn};

/// Bind the control socket, replacing a stale socket file
///
/// Permissions are set to 0660 so that owner and group can connect.
pub fn bind_unix_socket(socket_path: &str) -> std::io::Result<UnixListener> {
    let path = Path::new(socket_path);

    // Remove socket file if it already exists
    if path.exists() {
        info!("Removing existing socket file: {}", socket_path);
        std::fs::remove_file(path)?;
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            info!("Creating socket directory: {}", parent.display());
            std::fs::create_dir_all(parent)?;
        }
    }

    let listener = UnixListener::bind(socket_path)?;

    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o660);
        std::fs::set_permissions(socket_path, permissions)?;
    }

    Ok(listener)
}

/// Serve `app` on an already bound listener until `shutdown` resolves.
/// The socket file is removed on exit.
pub async fn serve_listener<F>(
    listener: UnixListener,
    socket_path: &str,
    app: Router,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("REST API server listening on Unix socket: {}", socket_path);

    let stream = UnixListenerStream::new(listener);
    let result = axum::Server::builder(accept::from_stream(stream))
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await;

    let path = Path::new(socket_path);
    if path.exists() {
        warn!("Cleaning up socket file: {}", socket_path);
        let _ = std::fs::remove_file(path);
    }

    result.map_err(Into::into)
}

/// Bind and serve the REST API on a Unix socket until `shutdown` resolves
pub async fn serve_on_unix_socket<F>(
    socket_path: &str,
    app: Router,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = bind_unix_socket(socket_path)?;
    serve_listener(listener, socket_path, app, shutdown).await
}
