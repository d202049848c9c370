//! JSON-lines transport
//!
//! One request per stdin line: `{"id", "action", "params"}`.
//! One response per stdout line: `{"id", "code", "result"}`.
//! Requests run concurrently, so responses may arrive out of order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shadowdesk_core::{MainService, Request, ServiceResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Value,
    #[serde(flatten)]
    request: Request,
}

#[derive(Serialize)]
struct Reply {
    id: Value,
    #[serde(flatten)]
    result: ServiceResult,
}

/// Serve until stdin closes or a shutdown signal arrives
pub async fn serve(service: Arc<MainService>) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_replies(rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    let service = service.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let reply = handle_line(&service, &line).await;
                        match serde_json::to_string(&reply) {
                            Ok(out) => {
                                let _ = tx.send(out);
                            }
                            Err(e) => warn!("Failed to encode reply: {}", e),
                        }
                    });
                }
                None => {
                    info!("stdin closed");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    service.manager().shutdown().await;

    drop(tx);
    if tokio::time::timeout(DRAIN_TIMEOUT, writer).await.is_err() {
        warn!("Pending replies not flushed within {:?}", DRAIN_TIMEOUT);
    }
    Ok(())
}

async fn handle_line(service: &MainService, line: &str) -> Reply {
    match serde_json::from_str::<Envelope>(line) {
        Ok(envelope) => {
            debug!("Request {} ({})", envelope.id, envelope.request.action);
            Reply {
                id: envelope.id,
                result: service.handle(envelope.request).await,
            }
        }
        Err(e) => Reply {
            id: Value::Null,
            result: ServiceResult::error(format!("Invalid request: {}", e)),
        },
    }
}

async fn write_replies(mut rx: mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        let written = async {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await
        };
        if let Err(e) = written.await {
            warn!("stdout closed: {}", e);
            break;
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shadowdesk_core::{
        BinaryLauncher, ClientOptions, HttpClient, Prober, RuntimeDir, SessionManager,
    };

    fn service(dir: &std::path::Path) -> MainService {
        let manager = SessionManager::new(
            Arc::new(BinaryLauncher::new("ss-local", "ssr-local")),
            RuntimeDir::new(dir),
            ClientOptions::default(),
        );
        MainService::new(
            Arc::new(manager),
            Arc::new(Prober::with_defaults()),
            Arc::new(HttpClient::with_defaults()),
        )
    }

    #[tokio::test]
    async fn test_reply_echoes_id() {
        let tmp = tempfile::tempdir().unwrap();
        let reply = handle_line(&service(tmp.path()), r#"{"id": 7, "action": "isConnected"}"#).await;
        let out = serde_json::to_value(&reply).unwrap();
        assert_eq!(out, json!({ "id": 7, "code": 200, "result": false }));
    }

    #[tokio::test]
    async fn test_invalid_line() {
        let tmp = tempfile::tempdir().unwrap();
        let reply = handle_line(&service(tmp.path()), "not json").await;
        let out = serde_json::to_value(&reply).unwrap();
        assert_eq!(out["id"], Value::Null);
        assert_eq!(out["code"], json!(500));
        assert!(out["result"].as_str().unwrap().starts_with("Invalid request"));
    }
}
