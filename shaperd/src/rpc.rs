//! Newline-delimited JSON front for the orchestrator.
//!
//! Each line a client sends is one request, answered by exactly one line:
//!
//! ```text
//! -> {"method": "isShaped", "params": {"controllingIP": "10.0.0.1", "controlledIP": "10.0.0.1"}}
//! <- {"result": false}
//! -> {"method": "getCurrentShaping", "params": {"controllingIP": "10.0.0.1", "controlledIP": "10.0.0.1"}}
//! <- {"error": {"code": "UNKNOWN_IP", "message": "IP 10.0.0.1 is not being shaped"}}
//! ```
//!
//! Mutating methods always answer with a `{code, message}` result, even when the code is
//! not `OK`. Lookups that can fail answer with an error.

use std::{io, net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::{
    codec::{Framed, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};

use crate::{
    backend::ShapingBackend,
    orchestrator::Orchestrator,
    types::{Device, ShapingRc, ShapingSession},
};

/// Longest request line accepted, in bytes.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Error code of requests that could not be decoded.
pub const BAD_REQUEST: &str = "BAD_REQUEST";

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Request {
    StartShaping(ShapingSession),
    StopShaping(Device),
    GetCurrentShaping(Device),
    IsShaped(Device),
    GetShapedDeviceCount,
    RequestToken { ip: String, duration: u64 },
    RequestRemoteControl { device: Device, token: String },
    GetDevicesControlledBy { ip: String },
    GetDevicesControlling { ip: String },
}

/// Error body of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    /// A [`ReturnCode`](crate::error::ReturnCode) name, or [`BAD_REQUEST`].
    pub code: String,
    pub message: String,
}

/// A reply line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    Result(Value),
    Error(RpcError),
}

impl Response {
    fn result<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Self::Result(value),
            Err(e) => Self::error("INTERNAL", e),
        }
    }

    fn error(code: impl Serialize, message: impl ToString) -> Self {
        let code = match serde_json::to_value(code) {
            Ok(Value::String(code)) => code,
            _ => "INTERNAL".to_string(),
        };
        Self::Error(RpcError { code, message: message.to_string() })
    }
}

/// Runs `request` against the orchestrator.
pub async fn dispatch<B: ShapingBackend>(orch: &Orchestrator<B>, request: Request) -> Response {
    match request {
        Request::StartShaping(session) => {
            Response::result(ShapingRc::from(orch.start_shaping(session).await))
        }
        Request::StopShaping(device) => {
            Response::result(ShapingRc::from(orch.stop_shaping(&device).await))
        }
        Request::GetCurrentShaping(device) => match orch.get_current_shaping(&device) {
            Ok(settings) => Response::result(settings),
            Err(e) => Response::error(e.code(), e),
        },
        Request::IsShaped(device) => Response::result(orch.is_shaped(&device)),
        Request::GetShapedDeviceCount => Response::result(orch.shaped_device_count()),
        Request::RequestToken { ip, duration } => match orch.request_token(&ip, duration) {
            Ok(token) => Response::result(token),
            Err(e) => Response::error(e.code(), e),
        },
        Request::RequestRemoteControl { device, token } => {
            Response::result(orch.request_remote_control(&device, &token))
        }
        Request::GetDevicesControlledBy { ip } => Response::result(orch.devices_controlled_by(&ip)),
        Request::GetDevicesControlling { ip } => Response::result(orch.devices_controlling(&ip)),
    }
}

/// Decodes one request line, runs it and encodes the reply.
pub async fn handle_line<B: ShapingBackend>(orch: &Orchestrator<B>, line: &str) -> String {
    let response = match serde_json::from_str::<Request>(line) {
        Ok(request) => dispatch(orch, request).await,
        Err(e) => {
            tracing::debug!(error = %e, "undecodable request");
            Response::error(BAD_REQUEST, e)
        }
    };

    serde_json::to_string(&response).unwrap_or_else(|e| {
        format!(r#"{{"error":{{"code":"INTERNAL","message":"{}"}}}}"#, e.to_string().escape_default())
    })
}

/// Accepts connections on `listener` until `cancel` fires, serving each on its own task.
pub fn serve<B: ShapingBackend>(
    listener: TcpListener,
    orch: Arc<Orchestrator<B>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "rpc listening");
        }

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(stream, peer, Arc::clone(&orch), cancel.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "accepting rpc connection"),
            }
        }

        tracing::debug!("rpc server stopped");
    })
}

async fn serve_connection<B: ShapingBackend>(
    stream: TcpStream,
    peer: SocketAddr,
    orch: Arc<Orchestrator<B>>,
    cancel: CancellationToken,
) {
    tracing::debug!(%peer, "rpc connection opened");
    let mut conn = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = conn.next() => next,
        };

        let reply = match next {
            None => break,
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => handle_line(&orch, &line).await,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!(%peer, "request line too long");
                let response = Response::error(BAD_REQUEST, "request line too long");
                match serde_json::to_string(&response) {
                    Ok(reply) => reply,
                    Err(_) => break,
                }
            }
            Some(Err(LinesCodecError::Io(e))) => {
                log_io_error(peer, &e);
                break;
            }
        };

        if let Err(e) = conn.send(reply).await {
            tracing::debug!(%peer, error = %e, "writing rpc reply");
            break;
        }
    }

    tracing::debug!(%peer, "rpc connection closed");
}

fn log_io_error(peer: SocketAddr, e: &io::Error) {
    if e.kind() == io::ErrorKind::ConnectionReset {
        tracing::debug!(%peer, "rpc connection reset");
    } else {
        tracing::warn!(%peer, error = %e, "reading rpc request");
    }
}
