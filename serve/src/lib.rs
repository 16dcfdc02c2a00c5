//! Single-process HTTP responder.
//!
//! Takes a route table mapping (method, path) to a static response and
//! binds exactly one listening socket. Binding happens inside whatever
//! network namespace the process was started in; host reachability is
//! the runtime's port-mapping business, not this crate's.

use axum::http::{Method, StatusCode};
use axum::routing::{MethodFilter, MethodRouter};
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;

/// The walkthrough's one response body.
pub const HELLO_BODY: &str = "Hello World!";

/// Default listening port.
pub const DEFAULT_PORT: u16 = 3000;

/// Service errors
#[derive(Error, Debug)]
pub enum ServeError {
    /// Requested port already in use or not bindable
    #[error("Cannot bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Route table rejected
    #[error("Invalid route: {0}")]
    Route(String),

    /// Serving failed after startup
    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// One static route entry.
#[derive(Debug, Clone)]
struct RouteEntry {
    method: Method,
    path: String,
    status: StatusCode,
    body: String,
}

/// Route table: (method, path) → static response. Anything unmatched
/// gets a 404.
#[derive(Debug, Clone, Default)]
pub struct Routes {
    entries: Vec<RouteEntry>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a 200 response for a method and path.
    pub fn add(mut self, method: Method, path: &str, body: &str) -> Self {
        self.entries.push(RouteEntry {
            method,
            path: path.to_string(),
            status: StatusCode::OK,
            body: body.to_string(),
        });
        self
    }

    /// The demonstrated table: GET `/` → 200 `Hello World!`.
    pub fn hello() -> Self {
        Self::new().add(Method::GET, "/", HELLO_BODY)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build the axum router for a route table.
///
/// Anything outside the table (unknown path, or unlisted method on a
/// known path) gets the same 404, not a 405.
pub fn router(routes: &Routes) -> Result<Router, ServeError> {
    use std::collections::BTreeMap;

    async fn not_found() -> (StatusCode, &'static str) {
        (StatusCode::NOT_FOUND, "404 page not found\n")
    }

    let mut by_path: BTreeMap<&str, Vec<&RouteEntry>> = BTreeMap::new();
    for entry in &routes.entries {
        by_path.entry(entry.path.as_str()).or_default().push(entry);
    }

    let mut router = Router::new();
    for (path, entries) in by_path {
        let mut method_router = MethodRouter::new();
        for entry in entries {
            let filter = MethodFilter::try_from(entry.method.clone())
                .map_err(|e| ServeError::Route(format!("{} {}: {e}", entry.method, entry.path)))?;
            let status = entry.status;
            let body = entry.body.clone();
            method_router = method_router.on(filter, move || async move { (status, body) });
        }
        router = router.route(path, method_router.fallback(not_found));
    }
    Ok(router.fallback(not_found))
}

/// Bind the listening socket for the given port.
pub async fn bind(port: u16) -> Result<TcpListener, ServeError> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|source| ServeError::Bind { port, source })?;
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Listening");
    }
    Ok(listener)
}

/// Serve the route table on an already-bound socket.
pub async fn serve(listener: TcpListener, routes: Routes) -> Result<(), ServeError> {
    let app = router(&routes)?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Bind and serve in one step: `start(port, routes)`.
pub async fn start(port: u16, routes: Routes) -> Result<(), ServeError> {
    let listener = bind(port).await?;
    serve(listener, routes).await
}
