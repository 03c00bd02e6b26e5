use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use super::IpcError;
use super::codec::{MessageReader, write_message};
use crate::protocol::{ConnectionId, EngineCommand, EngineResponse};

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected(ConnectionId),
    Command(EngineCommand, ConnectionId),
    Disconnected(ConnectionId),
}

/// Listens on a Unix socket and serves every connection concurrently.
///
/// Commands arrive on the event receiver returned by [`IpcServer::bind`].
/// Responses are published on the broadcast sender tagged with the target
/// connection; the nil id reaches every connection.
pub struct IpcServer {
    path: PathBuf,
    listener: JoinHandle<()>,
}

impl IpcServer {
    pub async fn bind(
        path: &Path,
        capacity: usize,
    ) -> Result<
        (
            IpcServer,
            mpsc::Receiver<ServerEvent>,
            broadcast::Sender<(EngineResponse, ConnectionId)>,
        ),
        IpcError,
    > {
        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(IpcError::AddressInUse(path.to_path_buf()));
            }
            log::warn!("Removing stale socket {}", path.display());
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path).map_err(|source| match source.kind() {
            ErrorKind::AddrInUse => IpcError::AddressInUse(path.to_path_buf()),
            _ => IpcError::Bind {
                path: path.to_path_buf(),
                source,
            },
        })?;
        log::info!("IPC listening on {}", path.display());

        let capacity = capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(capacity);
        let (response_tx, _) = broadcast::channel::<(EngineResponse, ConnectionId)>(capacity);

        let listener = tokio::spawn(accept_loop(listener, event_tx, response_tx.clone()));

        Ok((
            IpcServer {
                path: path.to_path_buf(),
                listener,
            },
            event_rx,
            response_tx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        !self.listener.is_finished()
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.listener.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::debug!("Could not remove {}: {}", self.path.display(), e);
        }
    }
}

// Connection tasks live in the JoinSet, so aborting this task closes them all.
async fn accept_loop(
    listener: UnixListener,
    events: mpsc::Sender<ServerEvent>,
    responses: broadcast::Sender<(EngineResponse, ConnectionId)>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let id = Uuid::new_v4();
                    connections.spawn(serve_connection(
                        stream,
                        id,
                        events.clone(),
                        responses.subscribe(),
                    ));
                }
                Err(e) => {
                    log::warn!("Failed to accept IPC connection: {}", e);
                }
            },
            Some(_) = connections.join_next() => {}
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    id: ConnectionId,
    events: mpsc::Sender<ServerEvent>,
    mut responses: broadcast::Receiver<(EngineResponse, ConnectionId)>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = MessageReader::new(read_half);

    log::info!("IPC connection {} opened", id);
    if events.send(ServerEvent::Connected(id)).await.is_err() {
        return;
    }

    if let Err(e) = write_message(&mut write_half, &EngineResponse::Welcome(id)).await {
        log::warn!("Connection {}: {}", id, e);
    } else {
        loop {
            tokio::select! {
                message = reader.read_message::<EngineCommand>() => match message {
                    Ok(None) | Ok(Some(EngineCommand::Goodbye)) => break,
                    Ok(Some(command)) => {
                        log::debug!("Connection {} sent {:?}", id, command);
                        if events.send(ServerEvent::Command(command, id)).await.is_err() {
                            break;
                        }
                    }
                    Err(IpcError::Malformed(e)) => {
                        log::warn!("Connection {} sent a malformed message: {}", id, e);
                    }
                    Err(e) => {
                        log::warn!("Connection {}: {}", id, e);
                        break;
                    }
                },
                response = responses.recv() => match response {
                    Ok((response, target)) if target == id || target.is_nil() => {
                        if let Err(e) = write_message(&mut write_half, &response).await {
                            log::warn!("Connection {}: {}", id, e);
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Connection {} missed {} responses", id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    log::info!("IPC connection {} closed", id);
    let _ = events.send(ServerEvent::Disconnected(id)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

    async fn next_event(events: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn open(path: &Path) -> (MessageReader<OwnedReadHalf>, OwnedWriteHalf, ConnectionId) {
        let stream = UnixStream::connect(path).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = MessageReader::new(read_half);
        let Some(EngineResponse::Welcome(id)) = reader.read_message::<EngineResponse>().await.unwrap()
        else {
            panic!("expected a welcome");
        };
        (reader, write_half, id)
    }

    #[tokio::test]
    async fn routes_responses_by_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playit.sock");
        let (_server, mut events, responses) = IpcServer::bind(&path, 16).await.unwrap();

        let (mut reader_a, mut writer_a, id_a) = open(&path).await;
        let (mut reader_b, _writer_b, id_b) = open(&path).await;
        assert_ne!(id_a, id_b);

        let connected = [next_event(&mut events).await, next_event(&mut events).await];
        assert!(connected.contains(&ServerEvent::Connected(id_a)));
        assert!(connected.contains(&ServerEvent::Connected(id_b)));

        write_message(&mut writer_a, &EngineCommand::Status).await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ServerEvent::Command(EngineCommand::Status, id_a)
        );

        responses
            .send((EngineResponse::Shuffle(true), id_a))
            .unwrap();
        responses
            .send((EngineResponse::Stopped, Uuid::nil()))
            .unwrap();

        let first: Option<EngineResponse> = reader_a.read_message().await.unwrap();
        assert_eq!(first, Some(EngineResponse::Shuffle(true)));
        let second: Option<EngineResponse> = reader_a.read_message().await.unwrap();
        assert_eq!(second, Some(EngineResponse::Stopped));

        // b never sees the response addressed to a
        let only: Option<EngineResponse> = reader_b.read_message().await.unwrap();
        assert_eq!(only, Some(EngineResponse::Stopped));
    }

    #[tokio::test]
    async fn goodbye_ends_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playit.sock");
        let (_server, mut events, _responses) = IpcServer::bind(&path, 16).await.unwrap();

        let (_reader, mut writer, id) = open(&path).await;
        assert_eq!(next_event(&mut events).await, ServerEvent::Connected(id));

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"garbage\n")
            .await
            .unwrap();
        write_message(&mut writer, &EngineCommand::Goodbye).await.unwrap();
        assert_eq!(next_event(&mut events).await, ServerEvent::Disconnected(id));
    }

    #[tokio::test]
    async fn refuses_live_socket_and_replaces_stale_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playit.sock");

        {
            let (_server, _events, _responses) = IpcServer::bind(&path, 4).await.unwrap();
            assert!(matches!(
                IpcServer::bind(&path, 4).await,
                Err(IpcError::AddressInUse(_))
            ));
        }
        assert!(!path.exists(), "dropping the server removes the socket");

        // a socket file nobody listens on
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        let (server, _events, _responses) = IpcServer::bind(&path, 4).await.unwrap();
        assert!(server.is_running());
    }
}
