use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::IpcError;
use super::codec::{MessageReader, write_message};
use crate::protocol::{EngineCommand, EngineResponse};

/// Connection to an engine hosted by another process.
///
/// Responses come out of the receiver returned by [`IpcClient::connect`]; it
/// closes when the engine goes away.
pub struct IpcClient {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    commands: mpsc::Sender<EngineCommand>,
}

impl IpcClient {
    pub async fn connect(
        path: &Path,
        capacity: usize,
    ) -> Result<
        (
            IpcClient,
            mpsc::Receiver<EngineResponse>,
            mpsc::Sender<EngineCommand>,
        ),
        IpcError,
    > {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| IpcError::ConnectionFailed {
                path: path.to_path_buf(),
                source,
            })?;
        log::info!("Connected to engine at {}", path.display());

        let capacity = capacity.max(1);
        let (response_tx, response_rx) = mpsc::channel::<EngineResponse>(capacity);
        let (command_tx, mut command_rx) = mpsc::channel::<EngineCommand>(capacity);

        let (read_half, mut write_half) = stream.into_split();

        let reader = tokio::spawn(async move {
            let mut reader = MessageReader::new(read_half);
            loop {
                match reader.read_message::<EngineResponse>().await {
                    Ok(Some(response)) => {
                        if response_tx.send(response).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        log::info!("Engine closed the connection");
                        break;
                    }
                    Err(IpcError::Malformed(e)) => {
                        log::warn!("Malformed response from engine: {}", e);
                    }
                    Err(e) => {
                        log::warn!("Engine connection failed: {}", e);
                        break;
                    }
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let last = command == EngineCommand::Goodbye;
                if let Err(e) = write_message(&mut write_half, &command).await {
                    log::warn!("Failed to send command to engine: {}", e);
                    break;
                }
                if last {
                    break;
                }
            }
        });

        Ok((
            IpcClient {
                reader,
                writer,
                commands: command_tx.clone(),
            },
            response_rx,
            command_tx,
        ))
    }

    /// False once the engine side has gone away.
    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished() && !self.writer.is_finished()
    }

    /// Send one command and collect everything the engine answers to it.
    ///
    /// The command is followed by [`EngineCommand::None`]; the engine answers
    /// commands in order, so its `Ok(None)` marks the end of the reply.
    pub async fn request(
        path: &Path,
        command: EngineCommand,
        capacity: usize,
        timeout: Duration,
    ) -> Result<Vec<EngineResponse>, IpcError> {
        let (client, mut responses, commands) = IpcClient::connect(path, capacity).await?;

        let exchange = async {
            commands
                .send(command)
                .await
                .map_err(|_| IpcError::Closed)?;
            commands
                .send(EngineCommand::None)
                .await
                .map_err(|_| IpcError::Closed)?;

            let mut replies = Vec::new();
            loop {
                match responses.recv().await {
                    Some(EngineResponse::Ok(EngineCommand::None)) => return Ok(replies),
                    Some(EngineResponse::Welcome(_)) => {}
                    Some(response) => replies.push(response),
                    None => return Err(IpcError::Closed),
                }
            }
        };

        let result = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| IpcError::Timeout(timeout))?;
        drop(client);
        result
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        // The writer exits after delivering the goodbye.
        if self.commands.try_send(EngineCommand::Goodbye).is_err() {
            self.writer.abort();
        }
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{IpcServer, ServerEvent};
    use crate::protocol::LoopMode;

    #[tokio::test]
    async fn request_collects_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playit.sock");
        let (_server, mut events, responses) = IpcServer::bind(&path, 16).await.unwrap();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ServerEvent::Command(command, id) = event {
                    let replies = match command {
                        EngineCommand::Status => vec![
                            EngineResponse::Shuffle(false),
                            EngineResponse::LoopMode(LoopMode::LoopQueue),
                            EngineResponse::Volume(0.5),
                        ],
                        other => vec![EngineResponse::Ok(other)],
                    };
                    for reply in replies {
                        let _ = responses.send((reply, id));
                    }
                }
            }
        });

        // More replies than the channel holds.
        let replies = IpcClient::request(&path, EngineCommand::Status, 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            replies,
            vec![
                EngineResponse::Shuffle(false),
                EngineResponse::LoopMode(LoopMode::LoopQueue),
                EngineResponse::Volume(0.5),
            ]
        );
    }

    #[tokio::test]
    async fn connect_fails_without_engine() {
        let dir = tempfile::tempdir().unwrap();
        let result = IpcClient::connect(&dir.path().join("missing.sock"), 4).await;
        assert!(matches!(result, Err(IpcError::ConnectionFailed { .. })));
    }

    #[tokio::test]
    async fn responses_close_when_engine_goes_away() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playit.sock");
        let (server, _events, _responses) = IpcServer::bind(&path, 16).await.unwrap();

        let (client, mut responses, _commands) = IpcClient::connect(&path, 4).await.unwrap();
        assert!(matches!(
            responses.recv().await,
            Some(EngineResponse::Welcome(_))
        ));

        drop(server);
        let end = tokio::time::timeout(Duration::from_secs(5), responses.recv())
            .await
            .unwrap();
        assert_eq!(end, None);
        drop(client);
    }
}
