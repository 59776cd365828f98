//! The command channel: newline-delimited UTF-8 over a local stream
//! socket or a named-pipe pair. Every response ends with one of the
//! literal ack markers `done`, `error` or `shutdown`.

use std::io;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::command::{ApiRequest, ApiResponse, Command};
use super::messages::ApiEvent;
use crate::config::{ApiConfig, ApiFormat, ApiTransport};

/// Environment override for the transport selection
pub const TRANSPORT_ENV: &str = "BGPS_CLI_TRANSPORT";

/// Apply the `BGPS_CLI_TRANSPORT` override to the configured transport
pub fn effective_transport(config: &ApiConfig) -> ApiTransport {
    match std::env::var(TRANSPORT_ENV).as_deref() {
        Ok("socket") => match &config.transport {
            socket @ ApiTransport::Socket { .. } => socket.clone(),
            ApiTransport::Pipe { .. } => ApiTransport::Socket {
                path: "/var/run/bgps.sock".to_string(),
            },
        },
        Ok("pipe") => match &config.transport {
            pipe @ ApiTransport::Pipe { .. } => pipe.clone(),
            ApiTransport::Socket { .. } => ApiTransport::Pipe {
                pipe_in: "/var/run/bgps.in".to_string(),
                pipe_out: "/var/run/bgps.out".to_string(),
            },
        },
        _ => config.transport.clone(),
    }
}

/// Serve the command channel until the process goes away
pub async fn run(
    config: ApiConfig,
    requests: mpsc::UnboundedSender<ApiRequest>,
    events: broadcast::Sender<ApiEvent>,
) -> io::Result<()> {
    match effective_transport(&config) {
        ApiTransport::Socket { path } => {
            // A stale socket file from a previous run refuses the bind
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)?;
            info!("command channel listening on {}", path);
            let format = config.format;
            loop {
                let (stream, _) = listener.accept().await?;
                debug!("command channel client connected");
                let requests = requests.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let (read, write) = stream.into_split();
                    serve_lines(read, write, requests, events, format).await;
                });
            }
        }
        ApiTransport::Pipe { pipe_in, pipe_out } => {
            info!("command channel on pipes {} / {}", pipe_in, pipe_out);
            loop {
                // Reopen after each writer hangup
                let input = tokio::fs::File::open(&pipe_in).await?;
                let output = tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(&pipe_out)
                    .await?;
                serve_lines(input, output, requests.clone(), events.clone(), config.format)
                    .await;
            }
        }
    }
}

/// Sinks a response can be rendered into
#[async_trait]
trait ResponseSink {
    async fn line(&mut self, line: &str) -> io::Result<()>;
}

struct WriteSink<W: AsyncWrite + Unpin + Send>(W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ResponseSink for WriteSink<W> {
    async fn line(&mut self, line: &str) -> io::Result<()> {
        self.0.write_all(line.as_bytes()).await?;
        self.0.write_all(b"\n").await
    }
}

async fn serve_lines<R, W>(
    read: R,
    write: W,
    requests: mpsc::UnboundedSender<ApiRequest>,
    events: broadcast::Sender<ApiEvent>,
    format: ApiFormat,
) where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut sink = WriteSink(write);
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => return,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // A client may turn its connection into an event stream
        if line == "subscribe" {
            let mut rx = events.subscribe();
            while let Ok(event) = rx.recv().await {
                if sink.line(&event.to_json()).await.is_err() {
                    return;
                }
            }
            return;
        }

        let response = dispatch(line, &requests).await;
        if render(&mut sink, &response, format).await.is_err() {
            return;
        }
    }
}

pub(super) async fn dispatch(
    line: &str,
    requests: &mpsc::UnboundedSender<ApiRequest>,
) -> ApiResponse {
    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(reason) => {
            warn!("rejected command '{}': {}", line, reason);
            return ApiResponse::failed(reason);
        }
    };
    let (reply, answer) = oneshot::channel();
    if requests.send(ApiRequest { command, reply }).is_err() {
        return ApiResponse::failed("reactor is gone");
    }
    answer
        .await
        .unwrap_or_else(|_| ApiResponse::failed("no answer from the reactor"))
}

async fn render(
    sink: &mut impl ResponseSink,
    response: &ApiResponse,
    format: ApiFormat,
) -> io::Result<()> {
    match format {
        ApiFormat::Text => {
            for line in &response.lines {
                sink.line(line).await?;
            }
            if let Some(reason) = &response.error {
                sink.line(reason).await?;
            }
        }
        ApiFormat::Json => {
            let body = serde_json::json!({
                "response": response.lines,
                "error": response.error,
            });
            sink.line(&body.to_string()).await?;
        }
    }
    // The ack marker concludes the response in either format
    if response.shutdown {
        sink.line("shutdown").await
    } else if response.error.is_some() {
        sink.line("error").await
    } else {
        sink.line("done").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSink(Vec<String>);

    #[async_trait]
    impl ResponseSink for VecSink {
        async fn line(&mut self, line: &str) -> io::Result<()> {
            self.0.push(line.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_render_text_done() {
        let mut sink = VecSink(vec![]);
        let response = ApiResponse::with_lines(vec!["one".into(), "two".into()]);
        render(&mut sink, &response, ApiFormat::Text).await.unwrap();
        assert_eq!(sink.0, vec!["one", "two", "done"]);
    }

    #[tokio::test]
    async fn test_render_text_error() {
        let mut sink = VecSink(vec![]);
        let response = ApiResponse::failed("no such neighbor");
        render(&mut sink, &response, ApiFormat::Text).await.unwrap();
        assert_eq!(sink.0, vec!["no such neighbor", "error"]);
    }

    #[tokio::test]
    async fn test_render_json_keeps_marker() {
        let mut sink = VecSink(vec![]);
        let response = ApiResponse::with_lines(vec!["one".into()]);
        render(&mut sink, &response, ApiFormat::Json).await.unwrap();
        assert_eq!(sink.0.len(), 2);
        assert!(sink.0[0].contains("\"response\""));
        assert_eq!(sink.0[1], "done");
    }

    #[tokio::test]
    async fn test_render_shutdown_marker() {
        let mut sink = VecSink(vec![]);
        let response = ApiResponse::shutdown();
        render(&mut sink, &response, ApiFormat::Text).await.unwrap();
        assert_eq!(sink.0, vec!["shutdown"]);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_garbage() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let response = dispatch("frobnicate the flux", &tx).await;
        assert!(response.error.is_some());
    }
}
