//! Solver port.
//!
//! The solver is the external build daemon that turns a Dockerfile plus
//! context into a pushed registry image. Dazzle only ever asks it to solve a
//! request and to stream progress; scheduling, caching and layer production
//! are the daemon's business. `GrpcSolver` speaks the `dazzle-api` protocol
//! over a unix socket or TCP.

pub mod progress;

use crate::error::{DazzleError, Result};
use async_trait::async_trait;
use dazzle_api::solver::v1 as pb;
use dazzle_api::solver::v1::solver_client::SolverClient;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;
use uuid::Uuid;

/// Exporter key carrying the digest of the produced image.
pub const EXPORTER_IMAGE_DIGEST: &str = "containerimage.digest";

/// A single build request for the solver.
#[derive(Debug, Clone, Default)]
pub struct SolveRequest {
    /// Frontend interpreting the context; always `"dockerfile"` here.
    pub frontend: String,
    /// Frontend attributes, notably `build-arg:<k>`.
    pub frontend_attrs: HashMap<String, String>,
    /// Build context directory.
    pub context_dir: PathBuf,
    pub cache_imports: Vec<CacheOptions>,
    pub cache_exports: Vec<CacheOptions>,
    /// Registry credentials attached to the solver session.
    pub credentials: Vec<RegistryCredential>,
    /// Image export; absent for builds run purely for their side output.
    pub export: Option<ImageExport>,
    pub no_cache: bool,
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub kind: String,
    pub attrs: HashMap<String, String>,
}

impl CacheOptions {
    /// Registry-backed cache at `reference`.
    pub fn registry(reference: &str) -> Self {
        Self {
            kind: "registry".to_string(),
            attrs: HashMap::from([("ref".to_string(), reference.to_string())]),
        }
    }

    /// Cache metadata embedded in the exported image.
    pub fn inline() -> Self {
        Self {
            kind: "inline".to_string(),
            attrs: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryCredential {
    pub host: String,
    pub username: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct ImageExport {
    pub name: String,
    pub push: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SolveResponse {
    pub exporter_response: HashMap<String, String>,
}

impl SolveResponse {
    /// The content digest of the produced image.
    pub fn image_digest(&self) -> Result<&str> {
        self.exporter_response
            .get(EXPORTER_IMAGE_DIGEST)
            .map(String::as_str)
            .ok_or_else(|| DazzleError::BuildFailed {
                reason: "solver response carries no image digest".to_string(),
            })
    }
}

/// One progress frame from the solver's status stream.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub vertexes: Vec<Vertex>,
    pub logs: Vec<VertexLog>,
}

#[derive(Debug, Clone, Default)]
pub struct Vertex {
    pub digest: String,
    pub name: String,
    pub cached: bool,
    pub started: bool,
    pub completed: bool,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct VertexLog {
    pub vertex: String,
    pub data: Vec<u8>,
}

/// The solver port. Implementations must deliver every status frame they
/// receive to the provided channel and close it when the solve finishes.
#[async_trait]
pub trait Solver: Send + Sync {
    async fn solve(
        &self,
        request: SolveRequest,
        status: mpsc::Sender<StatusUpdate>,
        cancel: CancellationToken,
    ) -> Result<SolveResponse>;
}

/// gRPC client for the build daemon.
pub struct GrpcSolver {
    channel: Channel,
    addr: String,
}

impl GrpcSolver {
    /// Connect to the daemon at `addr`, e.g.
    /// `unix:///run/buildkit/buildkitd.sock` or `http://localhost:1234`.
    pub async fn connect(addr: &str) -> Result<Self> {
        let channel = if let Some(path) = addr.strip_prefix("unix://") {
            let path = path.to_string();
            // The URI is required by tonic but unused for unix sockets.
            Endpoint::try_from("http://[::]:50051")
                .map_err(|e| DazzleError::SolverUnavailable {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?
                .connect_with_connector(service_fn(move |_: Uri| {
                    UnixStream::connect(path.clone())
                }))
                .await
        } else {
            Endpoint::try_from(addr.to_string())
                .map_err(|e| DazzleError::SolverUnavailable {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?
                .connect()
                .await
        }
        .map_err(|e| DazzleError::SolverUnavailable {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            channel,
            addr: addr.to_string(),
        })
    }
}

#[async_trait]
impl Solver for GrpcSolver {
    async fn solve(
        &self,
        request: SolveRequest,
        status: mpsc::Sender<StatusUpdate>,
        cancel: CancellationToken,
    ) -> Result<SolveResponse> {
        let id = Uuid::new_v4().to_string();
        let proto_request = request_to_proto(&request, &id);

        let mut solve_client = SolverClient::new(self.channel.clone());
        let mut status_client = SolverClient::new(self.channel.clone());
        let addr = self.addr.clone();

        // Two cooperative tasks per solve: the call itself and the status
        // stream consumer. They join before control returns.
        let status_id = id.clone();
        let status_task = async move {
            let stream = status_client
                .status(pb::StatusRequest { id: status_id })
                .await;
            let mut stream = match stream {
                Ok(response) => response.into_inner(),
                Err(e) => {
                    debug!(error = %e, "status stream unavailable");
                    return;
                }
            };
            loop {
                match stream.message().await {
                    Ok(Some(update)) => {
                        if status.send(status_from_proto(update)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "status stream ended");
                        break;
                    }
                }
            }
        };

        let solve_task = async move {
            solve_client
                .solve(proto_request)
                .await
                .map(|response| SolveResponse {
                    exporter_response: response.into_inner().exporter_response,
                })
                .map_err(|e| map_grpc_error(&addr, e))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(DazzleError::Canceled),
            result = async {
                let (solve_result, ()) = tokio::join!(solve_task, status_task);
                solve_result
            } => result,
        }
    }
}

fn map_grpc_error(addr: &str, status: tonic::Status) -> DazzleError {
    match status.code() {
        tonic::Code::Unavailable => DazzleError::SolverUnavailable {
            addr: addr.to_string(),
            reason: status.message().to_string(),
        },
        tonic::Code::Cancelled => DazzleError::Canceled,
        _ => DazzleError::BuildFailed {
            reason: status.message().to_string(),
        },
    }
}

fn request_to_proto(request: &SolveRequest, id: &str) -> pb::SolveRequest {
    pb::SolveRequest {
        id: id.to_string(),
        frontend: request.frontend.clone(),
        frontend_attrs: request.frontend_attrs.clone().into_iter().collect(),
        context_dir: request.context_dir.to_string_lossy().to_string(),
        cache_imports: request.cache_imports.iter().map(cache_to_proto).collect(),
        cache_exports: request.cache_exports.iter().map(cache_to_proto).collect(),
        credentials: request
            .credentials
            .iter()
            .map(|c| pb::RegistryCredential {
                host: c.host.clone(),
                username: c.username.clone(),
                secret: c.secret.clone(),
            })
            .collect(),
        export: request.export.as_ref().map(|e| pb::ImageExport {
            name: e.name.clone(),
            push: e.push,
        }),
        no_cache: request.no_cache,
    }
}

fn cache_to_proto(cache: &CacheOptions) -> pb::CacheOptions {
    pb::CacheOptions {
        kind: cache.kind.clone(),
        attrs: cache.attrs.clone().into_iter().collect(),
    }
}

fn status_from_proto(update: pb::StatusUpdate) -> StatusUpdate {
    StatusUpdate {
        vertexes: update
            .vertexes
            .into_iter()
            .map(|v| Vertex {
                digest: v.digest,
                name: v.name,
                cached: v.cached,
                started: v.started_unix != 0,
                completed: v.completed_unix != 0,
                error: v.error,
            })
            .collect(),
        logs: update
            .logs
            .into_iter()
            .map(|l| VertexLog {
                vertex: l.vertex,
                data: l.data,
            })
            .collect(),
    }
}
