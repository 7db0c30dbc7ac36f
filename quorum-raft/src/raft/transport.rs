//! TCP transport for Raft RPCs.
//!
//! Every call opens a connection, writes one request frame and reads one
//! response frame. A frame is a big-endian `u32` length followed by the
//! bincode body.

use super::rpc::{RaftRequest, RaftResponse};
use bytes::{BufMut, BytesMut};
use quorum_common::error::{QuorumError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;

/// Server side of the transport: turns one request into one response.
/// Returning `None` closes the connection without a reply.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(&self, request: RaftRequest) -> Option<RaftResponse>;
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(QuorumError::Transport(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(QuorumError::Transport(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    // Grows with the bytes that actually arrive
    let mut buf = Vec::with_capacity(len.min(READ_CHUNK));
    reader.take(len as u64).read_to_end(&mut buf).await?;
    if buf.len() != len {
        return Err(QuorumError::Transport(format!(
            "frame truncated after {} of {} bytes",
            buf.len(),
            len
        )));
    }
    Ok(buf)
}

/// Sends `request` to `addr` and waits for the reply. `timeout` bounds the whole exchange.
pub async fn call(addr: &str, request: &RaftRequest, timeout: Duration) -> Result<RaftResponse> {
    let payload = request.encode()?;
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &payload).await?;
        let frame = read_frame(&mut stream).await?;
        RaftResponse::decode(&frame)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => Err(QuorumError::Transport(format!("{}: {}", addr, err))),
        Err(_) => Err(QuorumError::Transport(format!(
            "{}: no reply within {}ms",
            addr,
            timeout.as_millis()
        ))),
    }
}

async fn handle_connection<H: RpcHandler>(
    mut stream: TcpStream,
    handler: Arc<H>,
    read_timeout: Duration,
) -> Result<()> {
    let frame = tokio::time::timeout(read_timeout, read_frame(&mut stream))
        .await
        .map_err(|_| {
            QuorumError::Transport(format!(
                "no request within {}ms",
                read_timeout.as_millis()
            ))
        })??;
    let request = RaftRequest::decode(&frame)?;
    let term = request.term();
    match handler.handle(request) {
        Some(response) => write_frame(&mut stream, &response.encode()?).await?,
        None => debug!(term, "request dropped without reply"),
    }
    Ok(())
}

/// Accepts connections until `shutdown` flips to true.
///
/// Each connection must deliver its request within `read_timeout`. On return
/// the listener is dropped and every connection still open is aborted.
pub async fn serve<H: RpcHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
    read_timeout: Duration,
) {
    let mut connections = JoinSet::new();
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    connections.spawn(async move {
                        if let Err(err) = handle_connection(stream, handler, read_timeout).await {
                            debug!(%peer, %err, "rpc connection failed");
                        }
                    });
                }
                Err(err) => warn!(%err, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}
