use std::future::Future;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A phase's background work, polled without blocking the control loop.
#[derive(Debug)]
pub(crate) struct PhaseTask<T> {
    rx: oneshot::Receiver<T>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub(crate) enum TaskPoll<T> {
    Pending,
    Ready(T),
    /// The task panicked or was aborted before reporting
    Lost,
}

impl<T: Send + 'static> PhaseTask<T> {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let _ = tx.send(future.await);
        });
        Self { rx, handle }
    }

    pub(crate) fn poll(&mut self) -> TaskPoll<T> {
        match self.rx.try_recv() {
            Ok(value) => TaskPoll::Ready(value),
            Err(oneshot::error::TryRecvError::Empty) => TaskPoll::Pending,
            Err(oneshot::error::TryRecvError::Closed) => TaskPoll::Lost,
        }
    }

    pub(crate) fn abort(&self) {
        self.handle.abort();
    }
}
