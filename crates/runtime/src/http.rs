//! Embedded HTTP server.
//!
//! Servers are created through the process-wide [`HttpServerProvider`].
//! Looking the provider up is the guarded step; a server obtained from it
//! works normally afterwards.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::Runtime;
use crate::unit::{CodeUnit, HookError};

pub const PROVIDER_UNIT: &str = "http.HttpServerProvider";

/// Largest request body accepted.
const MAX_BODY: usize = 1 << 20;
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

pub fn provider_unit() -> CodeUnit {
    CodeUnit::new(PROVIDER_UNIT).method("provider")
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HttpError {
    #[error("HTTP server provider unavailable")]
    Blocked {
        #[source]
        source: HookError,
    },

    #[error("server already started")]
    AlreadyStarted,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Load(#[from] crate::Error),
}

pub type Result<T> = std::result::Result<T, HttpError>;

/// Factory for HTTP servers.
pub trait HttpServerProvider: Send + Sync + fmt::Debug {
    fn create_server(&self, addr: SocketAddr) -> Result<HttpServer>;
}

/// Provider backed by plain TCP listeners.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProvider;

impl HttpServerProvider for DefaultProvider {
    fn create_server(&self, addr: SocketAddr) -> Result<HttpServer> {
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        Ok(HttpServer {
            addr,
            listener: Some(listener),
            contexts: Vec::new(),
            stopped: Arc::new(AtomicBool::new(false)),
            server: None,
        })
    }
}

/// The provider for `runtime`. Gated by the http-server capability.
pub fn provider(runtime: &Runtime) -> Result<Arc<dyn HttpServerProvider>> {
    let unit = runtime.load(PROVIDER_UNIT)?;
    unit.enter("provider")
        .map_err(|source| HttpError::Blocked { source })?;
    Ok(Arc::new(DefaultProvider))
}

/// A parsed request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8".to_string(),
            body: body.into().into_bytes(),
        }
    }

    fn not_found() -> Self {
        Self::text(404, "not found")
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

type Handler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

/// An HTTP/1.1 server answering one request per connection.
pub struct HttpServer {
    addr: SocketAddr,
    listener: Option<TcpListener>,
    contexts: Vec<(String, Handler)>,
    stopped: Arc<AtomicBool>,
    server: Option<JoinHandle<()>>,
}

impl HttpServer {
    /// Create a server via the runtime's provider.
    pub fn create(runtime: &Runtime, addr: SocketAddr) -> Result<Self> {
        provider(runtime)?.create_server(addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Route requests under `path` to `handler`. The longest matching
    /// context wins.
    pub fn create_context<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.contexts.push((path.to_string(), Arc::new(handler)));
    }

    pub fn start(&mut self) -> Result<()> {
        let listener = self.listener.take().ok_or(HttpError::AlreadyStarted)?;
        let mut contexts = self.contexts.clone();
        contexts.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        let contexts = Arc::new(contexts);
        let stopped = Arc::clone(&self.stopped);
        let handle = thread::Builder::new()
            .name(format!("http-{}", self.addr.port()))
            .spawn(move || serve(listener, contexts, stopped))?;
        self.server = Some(handle);
        debug!(addr = %self.addr, "http server started");
        Ok(())
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let Some(handle) = self.server.take() else {
            return;
        };
        self.stopped.store(true, Ordering::SeqCst);
        // Wake the accept loop. A thread that cannot be woken is detached.
        if let Err(e) = TcpStream::connect_timeout(&self.addr, WAKE_TIMEOUT) {
            warn!(addr = %self.addr, error = %e, "cannot wake http server thread, detaching");
            return;
        }
        if handle.join().is_err() {
            warn!(addr = %self.addr, "http server thread panicked");
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.halt();
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let paths: Vec<&str> = self.contexts.iter().map(|(p, _)| p.as_str()).collect();
        f.debug_struct("HttpServer")
            .field("addr", &self.addr)
            .field("contexts", &paths)
            .field("running", &self.server.is_some())
            .finish()
    }
}

fn serve(listener: TcpListener, contexts: Arc<Vec<(String, Handler)>>, stopped: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let contexts = Arc::clone(&contexts);
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &contexts) {
                        debug!(error = %e, "http connection failed");
                    }
                });
            }
            Err(e) => warn!(error = %e, "http accept failed"),
        }
    }
}

fn handle_connection(stream: TcpStream, contexts: &[(String, Handler)]) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let response = match read_request(&mut reader)? {
        Some(request) => route(&request, contexts),
        None => Response::text(400, "bad request"),
    };
    write_response(&mut writer, &response)
}

fn route(request: &Request, contexts: &[(String, Handler)]) -> Response {
    contexts
        .iter()
        .find(|(path, _)| request.path.starts_with(path.as_str()))
        .map(|(_, handler)| handler(request))
        .unwrap_or_else(Response::not_found)
}

fn read_request<R: BufRead>(reader: &mut R) -> io::Result<Option<Request>> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut parts = line.split_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return Ok(None);
    };
    let (method, path) = (method.to_string(), path.to_string());

    let mut headers = Vec::new();
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 {
            break;
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let mut request = Request {
        method,
        path,
        headers,
        body: Vec::new(),
    };
    let length = request
        .header("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if length > MAX_BODY {
        return Ok(None);
    }
    request.body.resize(length, 0);
    reader.read_exact(&mut request.body)?;
    Ok(Some(request))
}

fn write_response<W: Write>(writer: &mut W, response: &Response) -> io::Result<()> {
    write!(
        writer,
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        reason(response.status),
        response.content_type,
        response.body.len()
    )?;
    writer.write_all(&response.body)?;
    writer.flush()
}
