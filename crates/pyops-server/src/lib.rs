//! Loopback HTTP control plane for pyops environments.
//!
//! Routes requests from the browser extension and web UI to the environment
//! registry and the process runners. Long-running pip installs are streamed
//! back line by line as chunked `text/plain`; everything else is answered
//! with a single JSON or text body.
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

pub mod body;
pub mod config;
pub mod handlers;
pub mod peer;
pub mod respond;
pub mod shutdown;

use crate::body::{read_payload, BodyError, Payload};
use crate::config::{ConfigError, ServiceConfig};
use crate::handlers::Rejection;
use crate::respond::{send, Reply};
use pyops_env::{DeletionGuard, EnvError, EnvRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tiny_http::{Method, Request, Server};
use tracing::{debug, error, info};

const ACCEPT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {message}")]
    Bind { addr: SocketAddr, message: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a request handler needs. Shared read-only across request threads.
pub struct App {
    pub registry: EnvRegistry,
    pub guard: DeletionGuard,
    pub base_python: PathBuf,
    pub snippet_timeout: Duration,
    pub max_body_bytes: usize,
}

impl App {
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ServerError> {
        let registry = EnvRegistry::new(config.roots.clone())?;
        let guard = DeletionGuard::new(config.roots.clone(), config.protected.iter().cloned());
        Ok(Self {
            registry,
            guard,
            base_python: config.base_python.clone(),
            snippet_timeout: config.snippet_timeout(),
            max_body_bytes: config.max_body_bytes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Health,
    Envs,
    CreateVenv,
    DeleteVenv,
    PipInstall,
    PipInstallReqs,
    PipInstallStream,
    PipInstallReqsStream,
    Run,
    RunSnippet,
}

impl Route {
    pub fn method(self) -> Method {
        match self {
            Self::Health | Self::Envs => Method::Get,
            _ => Method::Post,
        }
    }

    /// Snippet output is plain text, including its errors.
    fn speaks_text(self) -> bool {
        self == Self::RunSnippet
    }
}

/// Map a request URL to a route, ignoring any query string.
pub fn parse_route(url: &str) -> Option<Route> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let route = match path.trim_end_matches('/') {
        "/api/health" => Route::Health,
        "/api/envs" => Route::Envs,
        "/api/create-venv" => Route::CreateVenv,
        "/api/delete-venv" => Route::DeleteVenv,
        "/api/pip-install" => Route::PipInstall,
        "/api/pip-install-reqs" => Route::PipInstallReqs,
        "/api/pip-install-stream" => Route::PipInstallStream,
        "/api/pip-install-reqs-stream" => Route::PipInstallReqsStream,
        "/api/run" => Route::Run,
        "/run-snippet" => Route::RunSnippet,
        _ => return None,
    };
    Some(route)
}

fn dispatch(app: &App, route: Route, req: &mut Request) -> Result<Reply, Rejection> {
    let handler: fn(&App, Payload) -> Result<Reply, Rejection> = match route {
        Route::Health => return handlers::health(app),
        Route::Envs => return handlers::list_envs(app),
        Route::CreateVenv => handlers::create_venv,
        Route::DeleteVenv => handlers::delete_venv,
        Route::PipInstall => handlers::pip_install,
        Route::PipInstallReqs => handlers::pip_install_reqs,
        Route::PipInstallStream => handlers::pip_install_stream,
        Route::PipInstallReqsStream => handlers::pip_install_reqs_stream,
        Route::Run => handlers::run_script,
        Route::RunSnippet => handlers::run_snippet,
    };

    let payload = read_payload(req, app.max_body_bytes).map_err(|e| {
        let status = match &e {
            BodyError::TooLarge(_) => 413,
            BodyError::Unsupported(_) => 415,
            _ => 400,
        };
        Rejection {
            status,
            message: e.to_string(),
        }
    })?;
    handler(app, payload)
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(app: &App, mut req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let Some(route) = parse_route(&url) else {
        send(req, Rejection::not_found("not found").into_json());
        return;
    };
    if method != route.method() {
        let rejection = Rejection {
            status: 405,
            message: "method not allowed".to_owned(),
        };
        send(req, rejection.into_json());
        return;
    }

    let reply = match dispatch(app, route, &mut req) {
        Ok(reply) => reply,
        Err(rejection) => {
            info!("{method} {url} -> {}: {}", rejection.status, rejection.message);
            if route.speaks_text() {
                rejection.into_text()
            } else {
                rejection.into_json()
            }
        }
    };
    debug!("{method} {url} -> {}", reply.status());
    send(req, reply);
}

fn bind(addr: SocketAddr) -> Result<Server, ServerError> {
    Server::http(addr).map_err(|e| ServerError::Bind {
        addr,
        message: e.to_string(),
    })
}

/// Serve until a shutdown is requested. Each request gets its own thread so a
/// streaming install never blocks other callers.
pub fn run_server(app: &Arc<App>, addr: SocketAddr) -> Result<(), ServerError> {
    let server = bind(addr)?;
    info!("listening on http://{addr}");
    while !shutdown::shutdown_requested() {
        match server.recv_timeout(ACCEPT_POLL) {
            Ok(Some(request)) => spawn_handler(app, request),
            Ok(None) => {}
            Err(e) => {
                error!("accept failed: {e}");
                return Err(e.into());
            }
        }
    }
    info!("shutting down");
    Ok(())
}

fn spawn_handler(app: &Arc<App>, request: Request) {
    let app = Arc::clone(app);
    thread::spawn(move || handle_request(&app, request));
}

/// A test helper that starts a pyops server on a random port in a background thread.
///
/// The server listens on `127.0.0.1:{port}`. Drop the `TestServer` to stop
/// accepting requests (via `Server::unblock`).
pub struct TestServer {
    pub url: String,
    pub port: u16,
    server: Arc<Server>,
    _handle: thread::JoinHandle<()>,
}

impl TestServer {
    /// Start a test server bound to `127.0.0.1:0` (random port).
    pub fn start(app: App) -> Self {
        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind test HTTP server"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");

        let app = Arc::new(app);
        let srv = Arc::clone(&server);
        let handle = thread::spawn(move || {
            for request in srv.incoming_requests() {
                spawn_handler(&app, request);
            }
        });

        Self {
            url,
            port,
            server,
            _handle: handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_route_known_paths() {
        assert_eq!(parse_route("/api/health"), Some(Route::Health));
        assert_eq!(parse_route("/api/envs"), Some(Route::Envs));
        assert_eq!(parse_route("/api/create-venv"), Some(Route::CreateVenv));
        assert_eq!(parse_route("/api/delete-venv"), Some(Route::DeleteVenv));
        assert_eq!(
            parse_route("/api/pip-install-reqs-stream"),
            Some(Route::PipInstallReqsStream)
        );
        assert_eq!(parse_route("/run-snippet"), Some(Route::RunSnippet));
    }

    #[test]
    fn parse_route_ignores_query_and_trailing_slash() {
        assert_eq!(parse_route("/api/envs?x=1"), Some(Route::Envs));
        assert_eq!(parse_route("/api/run/"), Some(Route::Run));
    }

    #[test]
    fn parse_route_unknown() {
        assert_eq!(parse_route("/"), None);
        assert_eq!(parse_route("/api/run-snippet"), None);
        assert_eq!(parse_route("/api/pip"), None);
    }

    #[test]
    fn route_methods() {
        assert_eq!(Route::Health.method(), Method::Get);
        assert_eq!(Route::Envs.method(), Method::Get);
        assert_eq!(Route::CreateVenv.method(), Method::Post);
        assert_eq!(Route::RunSnippet.method(), Method::Post);
    }

    #[test]
    fn config_errors_keep_their_message() {
        let err: ServerError = ConfigError::NonLoopbackBind("0.0.0.0".parse().unwrap()).into();
        assert!(matches!(err, ServerError::Config(_)));
        assert_eq!(
            err.to_string(),
            "refusing to bind 0.0.0.0: the service only listens on loopback"
        );
    }

    #[test]
    fn app_from_config_rejects_empty_roots() {
        let config = ServiceConfig {
            roots: Vec::new(),
            ..ServiceConfig::default()
        };
        assert!(matches!(
            App::from_config(&config),
            Err(ServerError::Env(EnvError::NoRoots))
        ));
    }
}
