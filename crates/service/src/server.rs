//! Command server: accepts connections and runs each line through the
//! orchestrator.

use crate::error::Result;
use crate::service::MirroringService;
use dmirror_rpc::error::ErrorKind as RpcErrorKind;
use dmirror_rpc::framing::Channel;
use dmirror_rpc::protocol::{Ack, Method, Pong, Request, Response};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Connection lifecycle notifications, see [`MirroringService::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    ClientOpen(SocketAddr),
    ClientClose(SocketAddr),
}

/// Accept connections until `shutdown` fires, then wait for every open
/// connection to finish the command it is processing.
pub(crate) async fn accept_loop(listener: TcpListener, service: MirroringService, shutdown: CancellationToken) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(stream, peer, service.clone(), shutdown.clone()));
                },
                Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {},
        }
    }
    drop(listener);
    tracing::debug!(connections = connections.len(), "Listener closed; waiting for connections");
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, service: MirroringService, shutdown: CancellationToken) {
    service.publish(ServerEvent::ClientOpen(peer));
    tracing::debug!(%peer, "Client connected");
    let mut channel = Channel::new(stream);
    loop {
        let line = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            line = channel.recv_line() => line,
        };
        let (response, stop) = match line {
            Ok(Some(line)) => dispatch(&service, &line).await,
            Ok(None) => break,
            // Over-long line; the codec ends the stream after this.
            Err(e) if matches!(&*e, RpcErrorKind::Protocol(_)) => (Response::err(0, e.to_string()), false),
            Err(e) => {
                tracing::debug!(%peer, error = %e, "Connection failed");
                break;
            },
        };
        if let Err(e) = channel.send(&response).await {
            tracing::debug!(%peer, error = %e, "Could not send response");
            break;
        }
        if stop {
            let service = service.clone();
            tokio::spawn(async move {
                if let Err(e) = service.close().await {
                    tracing::error!(error = ?e, "Shutdown failed");
                }
            });
        }
    }
    tracing::debug!(%peer, "Client disconnected");
    service.publish(ServerEvent::ClientClose(peer));
}

/// Run one request line. Returns the response and whether the service
/// should stop once it has been sent.
async fn dispatch(service: &MirroringService, line: &str) -> (Response, bool) {
    let request = match Request::parse(line) {
        Ok(request) => request,
        Err(e) => return (Response::err(0, e.to_string()), false),
    };
    let id = request.id;
    let mirroring = service.mirroring();
    tracing::trace!(id, method = %request.method, "Request");
    let response = match (request.method, request.params) {
        (Method::Mirror, Some(target)) => reply(id, mirroring.mirror(target.key, target.kind).await),
        (Method::Unmirror, Some(target)) => reply(id, mirroring.unmirror(target.key, target.kind).await),
        (Method::Status, Some(target)) => reply(id, mirroring.status(target.key, target.kind)),
        (Method::List, _) => reply(id, mirroring.list_all().await),
        (Method::Ping, _) => ok(id, &Pong::default()),
        (Method::Stop, _) => return (ok(id, &Ack { ok: true }), true),
        // `Request::parse` rejects these.
        (Method::Mirror | Method::Unmirror | Method::Status, None) => Response::err(id, "missing params"),
    };
    (response, false)
}

fn ok<T: Serialize>(id: u64, value: &T) -> Response {
    Response::ok(id, value).unwrap_or_else(|e| Response::err(id, e.to_string()))
}

fn reply<T: Serialize>(id: u64, result: Result<T>) -> Response {
    match result {
        Ok(value) => ok(id, &value),
        Err(e) => {
            tracing::warn!(id, error = ?e, "Command failed");
            Response::err(id, e.to_string())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Options;
    use dmirror_replicate::Key;
    use dmirror_replicate::memory::MemoryClient;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_buffered_request_is_not_run_after_shutdown() {
        let options = Options { endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), ..Options::default() };
        let service = MirroringService::open(options, Arc::new(MemoryClient::default())).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut remote = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let key = Key::from_bytes([1; 32]);
        let line = format!("{{\"id\":1,\"method\":\"mirror\",\"params\":{{\"key\":\"{}\"}}}}\n", key.to_hex());
        remote.write_all(line.as_bytes()).await.unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        serve_connection(stream, peer, service.clone(), shutdown).await;

        assert!(!service.mirroring().is_mirrored(&key));
        // Closed without a response.
        let mut buf = Vec::new();
        assert_eq!(remote.read_to_end(&mut buf).await.unwrap(), 0);

        service.close().await.unwrap();
    }
}
