//! Tiny, unassuming HTTP server
//!
//! One listener, a small pool of worker threads, one `Handler`
//! implementation per agent mode. Scrape traffic is cheap and rare; the pool
//! exists so a parked `/inspect/wait` long-poll cannot block a concurrent
//! scrape.

use crate::constants;
use crate::engine::unique::NotifyFn;
use crate::engine::{RateAlert, StandardEngine, UniqueEngine};
use crate::exposition;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// HTTP request. Alias of tiny_http::Request.
pub type Request = tiny_http::Request;

/// Simple HTTP request handler, shared by the worker pool.
pub trait Handler: Send + Sync {
    /// Handle -- and respond to -- a single HTTP request.
    fn handle(&self, request: Request);
}

/// A bound listener plus its worker threads. Dropping the `Server` closes
/// the listener; workers notice on their next receive.
pub struct Server {
    server: Arc<tiny_http::Server>,
    #[allow(dead_code)]
    workers: Vec<thread::JoinHandle<()>>,
}

impl Server {
    /// Bind `addr` and start `workers` threads feeding `handler`. A bind
    /// failure is returned to the caller; it is fatal at startup.
    pub fn bind<H>(addr: &str, handler: Arc<H>, workers: usize) -> io::Result<Server>
    where
        H: Handler + 'static,
    {
        let server = tiny_http::Server::http(addr)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let server = Arc::new(server);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let server = Arc::clone(&server);
            let handler = Arc::clone(&handler);
            handles.push(thread::spawn(move || loop {
                match server.recv() {
                    Ok(request) => handler.handle(request),
                    Err(e) => {
                        warn!("http worker shutting down: {}", e);
                        break;
                    }
                }
            }));
        }
        Ok(Server {
            server,
            workers: handles,
        })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.server_addr()
    }
}

fn content_type(value: &str) -> tiny_http::Header {
    tiny_http::Header::from_bytes(&b"Content-Type"[..], value.as_bytes())
        .expect("static header must parse")
}

/// Respond with a 200 and the given content type. A client that hung up
/// mid-response is logged and forgotten.
pub fn respond(request: Request, kind: &str, body: String) {
    let response = tiny_http::Response::from_string(body).with_header(content_type(kind));
    if let Err(e) = request.respond(response) {
        debug!("client went away: {}", e);
    }
}

/// Respond with a protocol error.
pub fn respond_error(request: Request, status: u16, body: &str) {
    let response = tiny_http::Response::from_string(body.to_string())
        .with_status_code(tiny_http::StatusCode(status))
        .with_header(content_type("text/plain"));
    if let Err(e) = request.respond(response) {
        debug!("client went away: {}", e);
    }
}

/// Strip the query string off a request url.
pub fn path_of(url: &str) -> &str {
    url.split('?').next().unwrap_or("")
}

/// The standard mode surface: exposition plus configuration echo.
pub struct StandardHandler {
    engine: Arc<StandardEngine>,
}

impl StandardHandler {
    /// Wrap an engine for serving.
    pub fn new(engine: Arc<StandardEngine>) -> StandardHandler {
        StandardHandler { engine }
    }
}

impl Handler for StandardHandler {
    fn handle(&self, request: Request) {
        let url = request.url().to_string();
        let method = request.method().clone();
        match (method, path_of(&url)) {
            (tiny_http::Method::Get, "/metrics") | (tiny_http::Method::Get, "/") => {
                respond(request, exposition::TEXT_CONTENT_TYPE, self.engine.exposition())
            }
            (tiny_http::Method::Get, "/config") => {
                respond(request, exposition::JSON_CONTENT_TYPE, self.engine.config_json())
            }
            _ => respond_error(request, 404, "not found\n"),
        }
    }
}

/// The notification side of the `/inspect/wait` long-poll: a depth-1 signal
/// channel plus a cumulative counter surfaced as the `X-Warnings` header.
pub struct AlertGate {
    alerts: Mutex<Receiver<RateAlert>>,
    warnings: Arc<AtomicUsize>,
}

/// Build the notify callback / gate pair. The callback never blocks: the
/// channel holds one pending signal and further alerts while one is pending
/// are coalesced into it.
pub fn alert_gate() -> (NotifyFn, AlertGate) {
    let (tx, rx): (SyncSender<RateAlert>, Receiver<RateAlert>) = sync_channel(1);
    let warnings = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&warnings);
    let tx = Mutex::new(tx);
    let notify: NotifyFn = Box::new(move |alert: &RateAlert| {
        counter.fetch_add(1, Ordering::Relaxed);
        let _ = tx.lock().unwrap().try_send(alert.clone());
    });
    (
        notify,
        AlertGate {
            alerts: Mutex::new(rx),
            warnings,
        },
    )
}

impl AlertGate {
    /// Block until an alert arrives or `timeout` passes. Waiters are
    /// serialised; each consumed signal wakes one of them.
    pub fn wait(&self, timeout: Duration) {
        let alerts = self.alerts.lock().unwrap();
        let _ = alerts.recv_timeout(timeout);
    }

    /// Total alerts fired since startup.
    pub fn warnings(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }
}

/// The unique mode surface: exposition, configuration echo and the two
/// introspection endpoints.
pub struct UniqueHandler {
    engine: Arc<UniqueEngine>,
    gate: AlertGate,
}

impl UniqueHandler {
    /// Wrap an engine and its alert gate for serving.
    pub fn new(engine: Arc<UniqueEngine>, gate: AlertGate) -> UniqueHandler {
        UniqueHandler { engine, gate }
    }

    fn respond_snapshot(&self, request: Request, waited: bool) {
        let body = exposition::snapshot_json(&self.engine.snapshot());
        let mut response =
            tiny_http::Response::from_string(body).with_header(content_type(exposition::JSON_CONTENT_TYPE));
        if waited {
            let warnings = self.gate.warnings().to_string();
            let header = tiny_http::Header::from_bytes(&b"X-Warnings"[..], warnings.as_bytes())
                .expect("static header must parse");
            response = response.with_header(header);
        }
        if let Err(e) = request.respond(response) {
            debug!("client went away: {}", e);
        }
    }
}

impl Handler for UniqueHandler {
    fn handle(&self, request: Request) {
        let url = request.url().to_string();
        let method = request.method().clone();
        match (method, path_of(&url)) {
            (tiny_http::Method::Get, "/metrics") | (tiny_http::Method::Get, "/") => {
                respond(request, exposition::TEXT_CONTENT_TYPE, self.engine.exposition())
            }
            (tiny_http::Method::Get, "/config") => {
                respond(request, exposition::JSON_CONTENT_TYPE, self.engine.config_json())
            }
            (tiny_http::Method::Get, "/inspect") => self.respond_snapshot(request, false),
            (tiny_http::Method::Get, "/inspect/wait") => {
                self.gate
                    .wait(Duration::from_secs(constants::WAIT_TIMEOUT_SECS));
                self.respond_snapshot(request, true);
            }
            _ => respond_error(request, 404, "not found\n"),
        }
    }
}
