use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::context::DaemonContext;

use super::dispatch;
use super::framing::{self, Response};

/// Bind the control socket, removing a stale one left behind by an unclean
/// shutdown first (SPEC_FULL §4.6 "Binding"). Fails only if a live daemon
/// already holds the socket.
pub fn bind(path: &str) -> std::io::Result<UnixListener> {
    if std::path::Path::new(path).exists() {
        let _ = std::fs::remove_file(path);
    }
    UnixListener::bind(path)
}

/// Accept connections until `ctx` reports a shutdown request, spawning one
/// task per connection so a slow client can never block another (SPEC_FULL
/// §4.6/§5 "one task per accepted connection").
///
/// Grounded on the teacher's Rocket-managed HTTP server loop (`daemon::api`'s
/// per-request handlers), generalized from an HTTP router to a raw line
/// protocol since GoPM speaks newline-delimited JSON over a Unix socket
/// rather than HTTP.
pub async fn serve(listener: UnixListener, ctx: Arc<DaemonContext>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, ctx).await {
                                log::debug!("rpc connection closed: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        log::warn!("failed to accept rpc connection: {err}");
                    }
                }
            }
            _ = ctx.wait_for_shutdown() => {
                break;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, ctx: Arc<DaemonContext>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    loop {
        let line = match framing::read_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(err) => {
                let response = framing::encode(&Response::err(format!("framing error: {err}")));
                let _ = reader.write_all(response.as_bytes()).await;
                return Err(err);
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let response = match framing::decode(&line) {
            Ok(request) => dispatch::handle(&ctx, request).await,
            Err(err) => Response::err(err),
        };

        reader.write_all(framing::encode(&response).as_bytes()).await?;
        reader.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::structs::Config;
    use crate::table::ProcessTable;
    use std::sync::Arc as StdArc;
    use tempfile::tempdir;
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn ping_round_trips_over_the_socket() {
        let dir = tempdir().unwrap();
        let sock_path = dir.path().join("gopm.sock");

        let listener = bind(sock_path.to_str().unwrap()).unwrap();
        let ctx = DaemonContext::new(StdArc::new(ProcessTable::new()), Config::default());
        let server_ctx = ctx.clone();
        let server = tokio::spawn(async move { serve(listener, server_ctx).await });

        let stream = UnixStream::connect(&sock_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"{\"method\":\"ping\"}\n").await.unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.contains("\"success\":true"));

        ctx.request_shutdown(false);
        let _ = server.await;
    }
}
