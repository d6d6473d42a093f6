//! Worker process entry point.
//!
//! Each worker is a child of the master, launched as a hidden subcommand of
//! the same binary. It loads the cached configuration snapshot, reports its
//! lifecycle over stdout, serves HTTP with `SO_REUSEPORT` so generations can
//! overlap during a rolling reload, and drains when the master asks over
//! stdin or closes the pipe.

use crate::config::{GatewayConfig, InstancePaths, ENV_PORT};
use crate::error::GatewayError;
use crate::ipc::{write_json_line, DisconnectRequest, WorkerMessage};
use crate::sequencer::PluginSequencer;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpSocket;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// How often the worker pushes a metrics snapshot to the master
const METRICS_INTERVAL: Duration = Duration::from_secs(30);
/// Grace given to in-flight connections once a drain begins
const DRAIN_GRACE: Duration = Duration::from_millis(250);

pub async fn run(config_dir: PathBuf) -> Result<(), GatewayError> {
    let paths = InstancePaths::new(config_dir);
    let config = GatewayConfig::load(&paths.cache_path())?;

    let port = std::env::var(ENV_PORT)
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(config.gateway.port);
    let addr: SocketAddr = format!("{}:{}", config.gateway.address, port)
        .parse()
        .map_err(|_| {
            GatewayError::Config(format!(
                "invalid listen address {}:{}",
                config.gateway.address, port
            ))
        })?;

    let pipe = Arc::new(Mutex::new(tokio::io::stdout()));
    write_json_line(&mut *pipe.lock().await, &WorkerMessage::Online).await?;

    let sequencer = Arc::new(PluginSequencer::new(&config));
    let requests = Arc::new(AtomicU64::new(0));

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;
    let local = listener.local_addr()?;
    write_json_line(
        &mut *pipe.lock().await,
        &WorkerMessage::Listening {
            address: local.to_string(),
        },
    )
    .await?;
    info!(address = %local, "Worker serving");

    let (drain_tx, mut drain_rx) = watch::channel(false);
    tokio::spawn(watch_stdin(drain_tx));

    {
        let pipe = Arc::clone(&pipe);
        let requests = Arc::clone(&requests);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = requests.swap(0, Ordering::Relaxed);
                let message = WorkerMessage::MetricsData {
                    data: json!({ "requests": snapshot }),
                };
                if write_json_line(&mut *pipe.lock().await, &message).await.is_err() {
                    return;
                }
            }
        });
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "Accept failed");
                        continue;
                    }
                };
                let sequencer = Arc::clone(&sequencer);
                let requests = Arc::clone(&requests);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        handle_request(req, Arc::clone(&sequencer), Arc::clone(&requests))
                    });
                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(error = %err, "Connection error");
                    }
                });
            }
            _ = drain_rx.changed() => {
                if *drain_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("Drain requested, shutting down worker");
    drop(listener);
    tokio::time::sleep(DRAIN_GRACE).await;
    Ok(())
}

/// Watch stdin for the master's drain request. EOF means the master is gone
/// (or closed the channel as an escalation), which drains as well.
async fn watch_stdin(drain_tx: watch::Sender<bool>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let parsed: Result<DisconnectRequest, _> = serde_json::from_str(&line);
                if matches!(parsed, Ok(request) if request.request_disconnect) {
                    let _ = drain_tx.send(true);
                    return;
                }
                debug!(%line, "Ignoring unrecognized message from master");
            }
            Ok(None) | Err(_) => {
                let _ = drain_tx.send(true);
                return;
            }
        }
    }
}

async fn handle_request<B>(
    req: Request<B>,
    sequencer: Arc<PluginSequencer>,
    requests: Arc<AtomicU64>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    requests.fetch_add(1, Ordering::Relaxed);
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let payload = sequence_payload(&sequencer, target);
    let mut response = Response::new(Full::new(Bytes::from(payload.to_string())));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

/// Resolved execution plan for one request target, as reported to callers
fn sequence_payload(sequencer: &PluginSequencer, target: &str) -> serde_json::Value {
    let sequence = sequencer.sequence_for(target);
    json!({
        "preflow": sequence.preflow_ids(),
        "postflow": sequence.postflow_ids(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_payload_shape() {
        let config = GatewayConfig::parse(
            "gateway:\n  plugins:\n    sequence: [analytics, metrics, oauth]\n",
        )
        .unwrap();
        let sequencer = PluginSequencer::new(&config);
        let payload = sequence_payload(&sequencer, "/api/v1?x=1");
        assert_eq!(
            payload["preflow"],
            json!(["analytics", "metrics", "oauth"])
        );
        assert_eq!(
            payload["postflow"],
            json!(["oauth", "metrics", "analytics"])
        );
    }
}
