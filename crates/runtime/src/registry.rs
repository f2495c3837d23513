//! Remote object registry.
//!
//! A registry is a TCP service mapping names to JSON values. Requests and
//! responses are single JSON lines; each stub call opens one connection.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::Runtime;
use crate::loader::UnitHandle;
use crate::unit::{CodeUnit, HookError};

pub const UNIT: &str = "registry.LocateRegistry";

/// Well-known registry port.
pub const DEFAULT_PORT: u16 = 1099;
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

pub fn unit() -> CodeUnit {
    CodeUnit::new(UNIT).methods([
        "get_registry",
        "get_registry_on",
        "get_registry_with",
        "create_registry",
        "create_registry_with",
    ])
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemoteError {
    #[error("registry stub not found")]
    StubNotFound {
        #[source]
        source: HookError,
    },

    #[error("connection to registry failed")]
    Connect(#[source] io::Error),

    #[error("cannot export registry")]
    Export(#[source] io::Error),

    #[error("not bound: {0}")]
    NotBound(String),

    #[error("already bound: {0}")]
    AlreadyBound(String),

    #[error("registry protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Load(#[from] crate::Error),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Creates client-side connections to a registry.
pub trait ClientSocketFactory: Send + Sync + fmt::Debug {
    fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream>;
}

/// Creates the listening socket of an exported registry.
pub trait ServerSocketFactory: Send + Sync + fmt::Debug {
    fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener>;
}

/// Plain TCP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSocketFactory;

impl ClientSocketFactory for DefaultSocketFactory {
    fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        TcpStream::connect(addr)
    }
}

impl ServerSocketFactory for DefaultSocketFactory {
    fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        TcpListener::bind(addr)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Lookup { name: String },
    Bind { name: String, value: Value },
    Rebind { name: String, value: Value },
    Unbind { name: String },
    List,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Response {
    Value { value: Value },
    Names { names: Vec<String> },
    Done,
    NotBound { name: String },
    AlreadyBound { name: String },
    Error { message: String },
}

/// Static-style accessors for registries. Every method is a
/// registry-capability entry point.
#[derive(Debug, Clone)]
pub struct LocateRegistry {
    unit: UnitHandle,
}

impl LocateRegistry {
    pub fn new(runtime: &Runtime) -> Result<Self> {
        Ok(Self {
            unit: runtime.load(UNIT)?,
        })
    }

    fn enter(&self, method: &str) -> Result<()> {
        self.unit
            .enter(method)
            .map_err(|source| RemoteError::StubNotFound { source })
    }

    /// Stub for the registry on the local host, default port.
    pub fn get_registry(&self) -> Result<RegistryStub> {
        self.enter("get_registry")?;
        stub(Ipv4Addr::LOCALHOST.to_string().as_str(), DEFAULT_PORT, Arc::new(DefaultSocketFactory))
    }

    pub fn get_registry_on(&self, host: &str, port: u16) -> Result<RegistryStub> {
        self.enter("get_registry_on")?;
        stub(host, port, Arc::new(DefaultSocketFactory))
    }

    pub fn get_registry_with(
        &self,
        host: &str,
        port: u16,
        factory: Arc<dyn ClientSocketFactory>,
    ) -> Result<RegistryStub> {
        self.enter("get_registry_with")?;
        stub(host, port, factory)
    }

    /// Export a registry on the loopback interface. Port 0 picks a free port.
    pub fn create_registry(&self, port: u16) -> Result<Registry> {
        self.enter("create_registry")?;
        Registry::export(port, Arc::new(DefaultSocketFactory), &DefaultSocketFactory)
    }

    pub fn create_registry_with(
        &self,
        port: u16,
        client: Arc<dyn ClientSocketFactory>,
        server: Arc<dyn ServerSocketFactory>,
    ) -> Result<Registry> {
        self.enter("create_registry_with")?;
        Registry::export(port, client, server.as_ref())
    }
}

fn stub(host: &str, port: u16, factory: Arc<dyn ClientSocketFactory>) -> Result<RegistryStub> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(RemoteError::Connect)?
        .next()
        .ok_or_else(|| {
            RemoteError::Connect(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {host}"),
            ))
        })?;
    Ok(RegistryStub { addr, factory })
}

/// Client proxy for a registry.
///
/// Creating a stub does not contact the registry; each call does.
#[derive(Debug, Clone)]
pub struct RegistryStub {
    addr: SocketAddr,
    factory: Arc<dyn ClientSocketFactory>,
}

impl RegistryStub {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn lookup(&self, name: &str) -> Result<Value> {
        match self.call(&Request::Lookup { name: name.to_string() })? {
            Response::Value { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub fn bind(&self, name: &str, value: Value) -> Result<()> {
        self.expect_done(&Request::Bind {
            name: name.to_string(),
            value,
        })
    }

    pub fn rebind(&self, name: &str, value: Value) -> Result<()> {
        self.expect_done(&Request::Rebind {
            name: name.to_string(),
            value,
        })
    }

    pub fn unbind(&self, name: &str) -> Result<()> {
        self.expect_done(&Request::Unbind { name: name.to_string() })
    }

    pub fn list(&self) -> Result<Vec<String>> {
        match self.call(&Request::List)? {
            Response::Names { names } => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    fn expect_done(&self, request: &Request) -> Result<()> {
        match self.call(request)? {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn call(&self, request: &Request) -> Result<Response> {
        let stream = self.factory.connect(self.addr).map_err(RemoteError::Connect)?;
        let mut writer = stream.try_clone().map_err(RemoteError::Connect)?;
        let mut line = serde_json::to_string(request).map_err(|e| RemoteError::Protocol(e.to_string()))?;
        line.push('\n');
        writer.write_all(line.as_bytes()).map_err(RemoteError::Connect)?;
        writer.flush().map_err(RemoteError::Connect)?;

        let mut reply = String::new();
        BufReader::new(stream)
            .read_line(&mut reply)
            .map_err(RemoteError::Connect)?;
        if reply.is_empty() {
            return Err(RemoteError::Protocol("connection closed".to_string()));
        }
        serde_json::from_str(&reply).map_err(|e| RemoteError::Protocol(e.to_string()))
    }
}

fn unexpected(response: Response) -> RemoteError {
    match response {
        Response::NotBound { name } => RemoteError::NotBound(name),
        Response::AlreadyBound { name } => RemoteError::AlreadyBound(name),
        Response::Error { message } => RemoteError::Protocol(message),
        other => RemoteError::Protocol(format!("unexpected response: {other:?}")),
    }
}

type Bindings = Arc<Mutex<BTreeMap<String, Value>>>;

/// An exported registry. Stops serving when dropped.
#[derive(Debug)]
pub struct Registry {
    addr: SocketAddr,
    client: Arc<dyn ClientSocketFactory>,
    stopped: Arc<AtomicBool>,
    server: Option<JoinHandle<()>>,
}

impl Registry {
    fn export(
        port: u16,
        client: Arc<dyn ClientSocketFactory>,
        server: &dyn ServerSocketFactory,
    ) -> Result<Self> {
        let listener = server
            .bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .map_err(RemoteError::Export)?;
        let addr = listener.local_addr().map_err(RemoteError::Export)?;
        let stopped = Arc::new(AtomicBool::new(false));
        let bindings: Bindings = Arc::default();

        let flag = Arc::clone(&stopped);
        let handle = thread::Builder::new()
            .name(format!("registry-{}", addr.port()))
            .spawn(move || serve(listener, bindings, flag))
            .map_err(RemoteError::Export)?;
        debug!(%addr, "registry exported");

        Ok(Self {
            addr,
            client,
            stopped,
            server: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stub for this registry using its client socket factory.
    pub fn stub(&self) -> RegistryStub {
        RegistryStub {
            addr: self.addr,
            factory: Arc::clone(&self.client),
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.server.take() else {
            return;
        };
        self.stopped.store(true, Ordering::SeqCst);
        // Wake the accept loop. A thread that cannot be woken is detached.
        if let Err(e) = TcpStream::connect_timeout(&self.addr, WAKE_TIMEOUT) {
            warn!(addr = %self.addr, error = %e, "cannot wake registry thread, detaching");
            return;
        }
        if handle.join().is_err() {
            warn!(addr = %self.addr, "registry thread panicked");
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(listener: TcpListener, bindings: Bindings, stopped: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let bindings = Arc::clone(&bindings);
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &bindings) {
                        debug!(error = %e, "registry connection ended");
                    }
                });
            }
            Err(e) => warn!(error = %e, "registry accept failed"),
        }
    }
}

fn handle_connection(stream: TcpStream, bindings: &Mutex<BTreeMap<String, Value>>) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(request, bindings),
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        };
        let mut out = serde_json::to_string(&response).map_err(io::Error::other)?;
        out.push('\n');
        writer.write_all(out.as_bytes())?;
        writer.flush()?;
    }
    Ok(())
}

fn dispatch(request: Request, bindings: &Mutex<BTreeMap<String, Value>>) -> Response {
    let mut bindings = bindings.lock().unwrap_or_else(PoisonError::into_inner);
    match request {
        Request::Lookup { name } => match bindings.get(&name) {
            Some(value) => Response::Value { value: value.clone() },
            None => Response::NotBound { name },
        },
        Request::Bind { name, value } => {
            if bindings.contains_key(&name) {
                return Response::AlreadyBound { name };
            }
            bindings.insert(name, value);
            Response::Done
        }
        Request::Rebind { name, value } => {
            bindings.insert(name, value);
            Response::Done
        }
        Request::Unbind { name } => match bindings.remove(&name) {
            Some(_) => Response::Done,
            None => Response::NotBound { name },
        },
        Request::List => Response::Names {
            names: bindings.keys().cloned().collect(),
        },
    }
}
