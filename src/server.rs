//! Stub server lifecycle and request dispatch.
//!
//! A [`StubServer`] owns its rules until [`StubServer::start`] snapshots them
//! into an immutable table shared by every connection task. Rules registered
//! while the server runs take effect on the next start.

use crate::config::{ConfigLoader, ConfigSource};
use crate::error::{Result, StubServerError};
use crate::matcher::Matcher;
use crate::request::Request;
use crate::response::{RawResponse, ResponseTemplate};
use crate::rule::{Rule, RuleTable};
use crate::template::TemplateEngine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Listener and logging settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    /// `0` picks an ephemeral port.
    pub port: u16,
    /// How long `stop` waits for in-flight requests.
    pub shutdown_grace: Duration,
    pub log_matches: bool,
    pub log_unmatched: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 12345,
            shutdown_grace: Duration::from_secs(5),
            log_matches: true,
            log_unmatched: true,
        }
    }
}

impl ServerOptions {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Request counters, cumulative across restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub requests_total: u64,
    pub requests_matched: u64,
    pub requests_unmatched: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    matched: AtomicU64,
    unmatched: AtomicU64,
}

/// Shared, read-only state of a running server.
struct Dispatcher {
    rules: RuleTable,
    templates: TemplateEngine,
    counters: Arc<Counters>,
    log_matches: bool,
    log_unmatched: bool,
}

impl Dispatcher {
    async fn handle(&self, req: hyper::Request<Incoming>) -> RawResponse {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, "Failed to read request body");
                return RawResponse::bad_request();
            }
        };
        let request = Request::from_parts(&parts.method, &parts.uri, &parts.headers, body);

        let Some((index, rule)) = self.rules.find_indexed(&request) else {
            self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
            if self.log_unmatched {
                warn!(
                    method = %request.method(),
                    uri = %request.uri(),
                    "No matching rule"
                );
            }
            return RawResponse::not_found();
        };

        self.counters.matched.fetch_add(1, Ordering::Relaxed);
        if self.log_matches {
            info!(
                rule = index,
                description = rule.description.as_deref().unwrap_or(""),
                method = %request.method(),
                uri = %request.uri(),
                "Request matched rule"
            );
        }

        if let Some(latency) = &rule.response.latency {
            let delay = latency.sample();
            if !delay.is_zero() {
                debug!(rule = index, delay_ms = delay.as_millis() as u64, "Applying latency");
                tokio::time::sleep(delay).await;
            }
        }

        match rule.response.render(&request, &self.templates) {
            Ok(response) => response,
            Err(e) => {
                error!(rule = index, error = %e, "Failed to render response");
                RawResponse::internal_error()
            }
        }
    }
}

fn into_hyper(response: RawResponse) -> hyper::Response<Full<Bytes>> {
    let mut builder = hyper::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Full::new(response.body)).unwrap_or_else(|e| {
        error!(error = %e, "Rendered response is not valid HTTP");
        let mut fallback = hyper::Response::new(Full::new(Bytes::from_static(b"Invalid response")));
        *fallback.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A stub server: an ordered rule table plus a listener lifecycle.
///
/// ```no_run
/// use http_stub_server::{running, Matcher, ServerOptions, StubServer};
///
/// # async fn demo() -> anyhow::Result<()> {
/// let mut server = StubServer::new(ServerOptions::default().with_port(0));
/// server.get(Matcher::uri("/foo")).response("Gotten");
/// server.post(Matcher::uri("/foo")).response("Posted");
///
/// running(&mut server, |addr| async move {
///     println!("listening on {addr}");
///     Ok::<_, anyhow::Error>(())
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub struct StubServer {
    options: ServerOptions,
    rules: RuleTable,
    state: ServerState,
    counters: Arc<Counters>,
    running: Option<RunningServer>,
}

impl StubServer {
    pub fn new(options: ServerOptions) -> Self {
        Self::with_rules(options, RuleTable::new())
    }

    pub fn with_rules(options: ServerOptions, rules: RuleTable) -> Self {
        Self {
            options,
            rules,
            state: ServerState::Stopped,
            counters: Arc::new(Counters::default()),
            running: None,
        }
    }

    /// Load a ruleset with the default [`ConfigLoader`].
    pub fn from_config(options: ServerOptions, source: ConfigSource) -> Result<Self> {
        let rules = ConfigLoader::new().load(source)?;
        Ok(Self::with_rules(options, rules))
    }

    /// Start a rule matched by `matcher`.
    pub fn request(&mut self, matcher: Matcher) -> PendingRule<'_> {
        PendingRule {
            server: self,
            matcher,
        }
    }

    pub fn get(&mut self, matcher: Matcher) -> PendingRule<'_> {
        self.request(Matcher::and([Matcher::method("GET"), matcher]))
    }

    pub fn post(&mut self, matcher: Matcher) -> PendingRule<'_> {
        self.request(Matcher::and([Matcher::method("POST"), matcher]))
    }

    pub fn put(&mut self, matcher: Matcher) -> PendingRule<'_> {
        self.request(Matcher::and([Matcher::method("PUT"), matcher]))
    }

    pub fn delete(&mut self, matcher: Matcher) -> PendingRule<'_> {
        self.request(Matcher::and([Matcher::method("DELETE"), matcher]))
    }

    /// Register a catch-all rule.
    pub fn response(&mut self, response: impl Into<ResponseTemplate>) -> &mut Self {
        self.register(Rule::catch_all(response))
    }

    pub fn register(&mut self, rule: Rule) -> &mut Self {
        if self.running.is_some() {
            debug!("Rule registered while running; it applies after restart");
        }
        self.rules.register(rule);
        self
    }

    /// Append a loaded rule table after the rules already registered.
    pub fn extend(&mut self, rules: RuleTable) -> &mut Self {
        self.rules.extend(rules);
        self
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.addr)
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            requests_total: self.counters.total.load(Ordering::Relaxed),
            requests_matched: self.counters.matched.load(Ordering::Relaxed),
            requests_unmatched: self.counters.unmatched.load(Ordering::Relaxed),
        }
    }

    /// Validate the rules, bind the listener and start accepting.
    ///
    /// Returns the bound address. On error the server stays stopped.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Err(StubServerError::AlreadyRunning(running.addr));
        }

        self.state = ServerState::Starting;
        match self.spawn().await {
            Ok(running) => {
                let addr = running.addr;
                info!(%addr, rules = self.rules.len(), "Stub server started");
                self.running = Some(running);
                self.state = ServerState::Running;
                Ok(addr)
            }
            Err(e) => {
                self.state = ServerState::Stopped;
                Err(e)
            }
        }
    }

    async fn spawn(&self) -> Result<RunningServer> {
        for (index, rule) in self.rules.iter().enumerate() {
            rule.matcher.validate().map_err(|e| e.at_rule(index))?;
            rule.response.validate().map_err(|e| e.at_rule(index))?;
        }

        let listener = bind(&self.options.host, self.options.port).await?;
        let addr = listener
            .local_addr()
            .map_err(|source| StubServerError::Bind {
                addr: format!("{}:{}", self.options.host, self.options.port),
                source,
            })?;

        let dispatcher = Arc::new(Dispatcher {
            rules: self.rules.clone(),
            templates: TemplateEngine::new(),
            counters: Arc::clone(&self.counters),
            log_matches: self.options.log_matches,
            log_unmatched: self.options.log_unmatched,
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve(
            listener,
            dispatcher,
            shutdown_rx,
            self.options.shutdown_grace,
        ));

        Ok(RunningServer {
            addr,
            shutdown,
            task,
        })
    }

    /// Stop accepting, drain in-flight requests and release the socket.
    ///
    /// Connections still busy after the grace period are closed. Calling
    /// `stop` on a stopped server does nothing.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        self.state = ServerState::Stopping;
        let addr = running.addr;
        let _ = running.shutdown.send(true);
        if let Err(e) = running.task.await {
            error!(%addr, error = %e, "Server task failed");
        }
        self.state = ServerState::Stopped;
        info!(%addr, "Stub server stopped");
    }

    /// Ask the accept loop to shut down without waiting for it.
    fn signal_shutdown(&self) {
        if let Some(running) = &self.running {
            let _ = running.shutdown.send(true);
        }
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

/// A rule waiting for its response; see [`StubServer::request`].
#[must_use = "a rule is only registered once `response` is called"]
pub struct PendingRule<'a> {
    server: &'a mut StubServer,
    matcher: Matcher,
}

impl<'a> PendingRule<'a> {
    pub fn response(self, response: impl Into<ResponseTemplate>) -> &'a mut StubServer {
        let server = self.server;
        server.register(Rule::new(self.matcher, response))
    }
}

/// Run `body` against a started server and stop it afterwards.
///
/// The server is stopped on every exit path of `body`: success, error,
/// panic or cancellation. Shutdown finishes before the body's result is
/// returned, except on panic and cancellation where it is only signalled.
pub async fn running<F, Fut, T, E>(server: &mut StubServer, body: F) -> std::result::Result<T, E>
where
    F: FnOnce(SocketAddr) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<StubServerError>,
{
    let addr = server.start().await?;
    let guard = StopGuard { server };
    let outcome = body(addr).await;
    guard.server.stop().await;
    outcome
}

struct StopGuard<'a> {
    server: &'a mut StubServer,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.server.signal_shutdown();
    }
}

/// On Unix tokio binds listeners with SO_REUSEADDR, so a restart on the same
/// port is not blocked by connections left in TIME_WAIT.
async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .map_err(|source| StubServerError::Bind {
            addr: format!("{host}:{port}"),
            source,
        })
}

async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    let service = service_fn(move |req: hyper::Request<Incoming>| {
                        let dispatcher = Arc::clone(&dispatcher);
                        async move { Ok::<_, Infallible>(into_hyper(dispatcher.handle(req).await)) }
                    });

                    let conn = http1::Builder::new()
                        .keep_alive(true)
                        .serve_connection(TokioIo::new(stream), service);
                    let conn = graceful.watch(conn);

                    connections.spawn(async move {
                        if let Err(e) = conn.await {
                            debug!(%peer, error = %e, "Connection closed with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    // New connections are refused from here on
    drop(listener);
    debug!(in_flight = connections.len(), "Draining connections");

    if tokio::time::timeout(grace, graceful.shutdown()).await.is_err() {
        warn!(
            grace_ms = grace.as_millis() as u64,
            "Grace period elapsed, closing remaining connections"
        );
    }
    connections.shutdown().await;
}
