//! Async Handle for a K-Line Client
//!
//! The client is synchronous and the line can only carry one transaction at a time.
//! [`KlineHandle`] moves a client onto its own thread and queues requests from any
//! number of async callers, answering each through a oneshot channel.

use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::client::{KlineClient, LinkState};
use crate::error::{ErrorCode, KlineError};
use crate::frame::Payload;
use crate::transport::{Gpio, Transport};

/// Requests waiting for the worker
const COMMAND_QUEUE_DEPTH: usize = 16;

enum Command {
    FastInit(oneshot::Sender<Result<(), KlineError>>),
    Request(Payload, oneshot::Sender<Result<Payload, KlineError>>),
    ReadRegister(u8, oneshot::Sender<Result<Vec<u8>, KlineError>>),
    Status(oneshot::Sender<(LinkState, ErrorCode)>),
}

/// Cloneable async front end to a client running on a worker thread
#[derive(Clone)]
pub struct KlineHandle {
    sender: mpsc::Sender<Command>,
}

/// Join handle of the worker thread
pub struct KlineWorker {
    thread: Option<JoinHandle<()>>,
}

impl KlineHandle {
    /// Move `client` onto a dedicated thread
    pub fn spawn<T>(mut client: KlineClient<T>) -> (Self, KlineWorker)
    where
        T: Transport + Gpio + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::channel::<Command>(COMMAND_QUEUE_DEPTH);

        let thread = std::thread::spawn(move || {
            info!("K-line worker started");
            while let Some(command) = receiver.blocking_recv() {
                // A dropped reply channel only means the caller stopped waiting.
                match command {
                    Command::FastInit(reply) => {
                        let _ = reply.send(client.fast_init());
                    }
                    Command::Request(payload, reply) => {
                        let _ = reply.send(client.request(&payload));
                    }
                    Command::ReadRegister(register, reply) => {
                        let _ = reply.send(client.read_register(register));
                    }
                    Command::Status(reply) => {
                        let _ = reply.send((client.link_state(), client.last_error()));
                    }
                }
            }
            debug!("All K-line handles dropped, stopping worker");
        });

        (
            Self { sender },
            KlineWorker {
                thread: Some(thread),
            },
        )
    }

    /// Run the fast-init handshake
    pub async fn fast_init(&self) -> Result<(), KlineError> {
        self.call(Command::FastInit).await?
    }

    /// Send one raw request
    pub async fn request(&self, payload: &[u8]) -> Result<Payload, KlineError> {
        let payload = Payload::from_slice(payload).map_err(|_| {
            KlineError::InvalidRequest(format!(
                "payload of {} bytes does not fit a frame",
                payload.len()
            ))
        })?;
        self.call(|reply| Command::Request(payload, reply)).await?
    }

    /// Read a register's data bytes
    pub async fn read_register(&self, register: u8) -> Result<Vec<u8>, KlineError> {
        self.call(|reply| Command::ReadRegister(register, reply)).await?
    }

    /// Current link state
    pub async fn link_state(&self) -> Result<LinkState, KlineError> {
        Ok(self.call(Command::Status).await?.0)
    }

    /// Code of the most recent failure
    pub async fn last_error(&self) -> Result<ErrorCode, KlineError> {
        Ok(self.call(Command::Status).await?.1)
    }

    async fn call<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, KlineError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(make(reply))
            .await
            .map_err(|_| KlineError::WorkerStopped)?;
        response.await.map_err(|_| KlineError::WorkerStopped)
    }
}

impl KlineWorker {
    /// Wait for the worker thread to exit.
    ///
    /// Returns once every [`KlineHandle`] has been dropped.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KlineConfig;
    use crate::mock::MockLine;

    fn scripted_client() -> KlineClient<MockLine> {
        let mut line = MockLine::new();
        line.reply(&[0xC1, 0xEA, 0x8F])
            .reply(&[0x50, 0x80])
            .reply(&[0x61, 0x0C, 0x0B, 0xB8])
            .reply(&[0x61, 0x05, 0x50]);
        KlineClient::new(line, KlineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_handle_serializes_requests() {
        let (handle, worker) = KlineHandle::spawn(scripted_client());
        assert_eq!(handle.link_state().await.unwrap(), LinkState::Uninitialized);

        handle.fast_init().await.unwrap();
        assert_eq!(handle.link_state().await.unwrap(), LinkState::Ready);

        let other = handle.clone();
        let (rpm, temp) = tokio::join!(handle.read_register(0x0C), async {
            // Queued behind the first read on the single line.
            tokio::task::yield_now().await;
            other.read_register(0x05).await
        });
        assert_eq!(rpm.unwrap(), vec![0x0B, 0xB8]);
        assert_eq!(temp.unwrap(), vec![0x50]);
        assert_eq!(handle.last_error().await.unwrap(), ErrorCode::Ok);

        drop(handle);
        drop(other);
        worker.join();
    }

    #[tokio::test]
    async fn test_handle_reports_failures() {
        let client = KlineClient::new(MockLine::new(), KlineConfig::default()).unwrap();
        let (handle, _worker) = KlineHandle::spawn(client);

        let err = handle.request(&[0u8; 12]).await.unwrap_err();
        assert!(matches!(err, KlineError::InvalidRequest(_)));

        let err = handle.fast_init().await.unwrap_err();
        assert_eq!(err.code().as_i32(), 1);
        assert_eq!(handle.last_error().await.unwrap().as_i32(), 1);
        assert_eq!(handle.link_state().await.unwrap(), LinkState::Faulted);
    }
}
