//! Minimal HTTP server for devices that fetch their image by URL.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::catalog::Catalog;
use crate::error::Result;

async fn fetch(State(catalog): State<Catalog>, Path(file): Path<String>) -> Response {
    let Some((data, count)) = catalog.fetch(&file) else {
        debug!("http: no such image {:?}", file);
        return StatusCode::NOT_FOUND.into_response();
    };

    info!(
        "http: serving {} ({} bytes, download #{})",
        file,
        data.len(),
        count
    );

    ([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response()
}

/// Serve every file in `catalog` as `/<name>` until `shutdown` fires.
///
/// Returns the bound port and the server task.
pub(super) async fn serve(
    bind: SocketAddr,
    catalog: Catalog,
    shutdown: oneshot::Receiver<()>,
) -> Result<(u16, JoinHandle<()>)> {
    let app = Router::new()
        .route("/{file}", get(fetch))
        .with_state(catalog);

    let listener = TcpListener::bind(bind).await?;
    let port = listener.local_addr()?.port();
    debug!("http: listening on {}", listener.local_addr()?);

    let task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.await;
            })
            .await;
        if let Err(e) = result {
            warn!("http: server stopped: {}", e);
        }
    });

    Ok((port, task))
}
