//! Length-prefixed JSON wire protocol for the remote store: one request per
//! connection, u32-LE frame length then the JSON body. Enough to exercise the
//! engine against a real socket; a hosted backend would sit behind the same
//! [`RemoteStore`] trait.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::record::{Entity, Record};
use crate::remote::{MemoryRemote, RemoteStore};

const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    List { partition: String, collection: String },
    Upsert { partition: String, collection: String, id: String, record: Value },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Response {
    Records { records: Vec<Value> },
    Done,
    Failed { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FailureKind {
    PermissionDenied,
    NotFound,
    Other,
}

fn write_frame<T: Serialize>(stream: &mut TcpStream, message: &T) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    stream.write_all(&(body.len() as u32).to_le_bytes())?;
    stream.write_all(&body)?;
    Ok(())
}

fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(Error::Network(format!("oversized frame: {} bytes", len)));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Client half: implements [`RemoteStore`] over one connection per operation.
pub struct TcpRemote {
    addr: String,
}

impl TcpRemote {
    pub fn connect_to(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    fn roundtrip(&self, partition: &str, request: &Request) -> Result<Response> {
        let mut stream = TcpStream::connect(&self.addr)
            .map_err(|e| Error::Network(format!("connect {}: {}", self.addr, e)))?;
        write_frame(&mut stream, request).map_err(as_connectivity)?;
        let response: Response = read_frame(&mut stream).map_err(as_connectivity)?;

        match response {
            Response::Failed { kind, message } => Err(match kind {
                FailureKind::PermissionDenied => Error::PermissionDenied(partition.to_string()),
                FailureKind::NotFound => Error::not_found("remote", message),
                FailureKind::Other => Error::Network(message),
            }),
            ok => Ok(ok),
        }
    }
}

/// Transport-level failures all count as connectivity errors to the
/// orchestrator; application failures travel inside `Response::Failed`.
fn as_connectivity(err: Error) -> Error {
    match err {
        e @ (Error::PermissionDenied(_) | Error::NotFound { .. }) => e,
        other => Error::Network(other.to_string()),
    }
}

impl RemoteStore for TcpRemote {
    fn list_by_partition<E: Entity>(&self, partition: &str) -> Result<Vec<Record<E>>> {
        let request = Request::List {
            partition: partition.to_string(),
            collection: E::COLLECTION.to_string(),
        };
        match self.roundtrip(partition, &request)? {
            Response::Records { records } => records
                .into_iter()
                .map(|value| Ok(serde_json::from_value(value)?))
                .collect(),
            other => Err(Error::Network(format!("unexpected response: {:?}", other))),
        }
    }

    fn upsert<E: Entity>(&self, partition: &str, record: &Record<E>) -> Result<()> {
        let request = Request::Upsert {
            partition: partition.to_string(),
            collection: E::COLLECTION.to_string(),
            id: record.id.canonical(),
            record: serde_json::to_value(record)?,
        };
        match self.roundtrip(partition, &request)? {
            Response::Done => Ok(()),
            other => Err(Error::Network(format!("unexpected response: {:?}", other))),
        }
    }
}

/// Server half: serves a shared [`MemoryRemote`] from a blocking accept loop.
pub struct RemoteServer {
    listener: TcpListener,
    store: Arc<MemoryRemote>,
}

impl RemoteServer {
    pub fn bind(addr: &str, store: Arc<MemoryRemote>) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener, store })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Detaches the accept loop. Connections are handled sequentially; the
    /// loop ends when the process does.
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for stream in self.listener.incoming() {
                match stream {
                    Ok(mut stream) => {
                        if let Err(err) = handle_connection(&mut stream, &self.store) {
                            warn!(error = %err, "remote server connection failed");
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "remote server accept failed");
                        break;
                    }
                }
            }
        })
    }
}

fn handle_connection(stream: &mut TcpStream, store: &MemoryRemote) -> Result<()> {
    let request: Request = read_frame(stream)?;
    debug!(?request, "remote server request");

    let response = match request {
        Request::List { partition, collection } => {
            match store.list_raw(&partition, &collection) {
                Ok(records) => Response::Records { records },
                Err(err) => failure(err),
            }
        }
        Request::Upsert { partition, collection, id, record } => {
            match store.upsert_raw(&partition, &collection, &id, record) {
                Ok(()) => Response::Done,
                Err(err) => failure(err),
            }
        }
    };

    write_frame(stream, &response)
}

fn failure(err: Error) -> Response {
    let kind = match &err {
        Error::PermissionDenied(_) => FailureKind::PermissionDenied,
        Error::NotFound { .. } => FailureKind::NotFound,
        _ => FailureKind::Other,
    };
    Response::Failed { kind, message: err.to_string() }
}
