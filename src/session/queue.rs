//! Serial executor owning a [`CaptureSession`].
//!
//! Every graph mutation, start/stop and capture trigger runs as a job on one
//! dedicated thread, so the session never needs a lock of its own. Async
//! callers await the job's result through a oneshot reply.

use super::CaptureSession;
use crate::errors::CameraError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce(&mut CaptureSession) + Send>;

pub struct SessionQueue {
    label: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionQueue {
    /// Move `session` onto a new thread named after `label`.
    pub fn spawn(session: CaptureSession, label: &str) -> Result<Self, CameraError> {
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let thread_label = label.to_string();

        let thread = std::thread::Builder::new()
            .name(format!("camcore-session-{label}"))
            .spawn(move || session_loop(session, receiver, thread_label))
            .map_err(|e| CameraError::DeviceUnavailable(format!("session thread: {e}")))?;

        Ok(Self {
            label: label.to_string(),
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_running(&self) -> bool {
        self.sender
            .lock()
            .map(|s| s.as_ref().is_some_and(|s| !s.is_closed()))
            .unwrap_or(false)
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<Job>, CameraError> {
        let guard = self.sender.lock().map_err(|_| CameraError::poisoned_lock())?;
        guard.clone().ok_or_else(|| {
            CameraError::InvalidSessionState(format!("session queue {} is shut down", self.label))
        })
    }

    /// Queue a job without waiting for it. Usable from non-async threads.
    pub fn dispatch<F>(&self, job: F) -> Result<(), CameraError>
    where
        F: FnOnce(&mut CaptureSession) + Send + 'static,
    {
        self.sender()?.send(Box::new(job)).map_err(|_| {
            CameraError::InvalidSessionState(format!("session queue {} is shut down", self.label))
        })
    }

    /// Run `f` on the session thread and wait for its result.
    pub async fn run<F, R>(&self, f: F) -> Result<R, CameraError>
    where
        F: FnOnce(&mut CaptureSession) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        self.dispatch(move |session| {
            let _ = reply.send(f(session));
        })?;

        result.await.map_err(|_| {
            CameraError::InvalidSessionState(format!(
                "session queue {} dropped the job",
                self.label
            ))
        })
    }

    /// Stop accepting jobs, let queued ones finish and join the thread. The
    /// session (and its device) is dropped on the session thread.
    pub async fn shutdown(&self) -> Result<(), CameraError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| CameraError::poisoned_lock())?
            .take();
        drop(sender);

        let thread = self
            .thread
            .lock()
            .map_err(|_| CameraError::poisoned_lock())?
            .take();
        let Some(thread) = thread else {
            return Ok(());
        };

        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| CameraError::InvalidSessionState(format!("join task failed: {e}")))?
            .map_err(|_| CameraError::InvalidSessionState("session thread panicked".to_string()))?;

        log::debug!("Session queue {} drained and joined", self.label);
        Ok(())
    }
}

impl Drop for SessionQueue {
    fn drop(&mut self) {
        // Closing the channel is enough for the thread to exit on its own.
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

fn session_loop(
    mut session: CaptureSession,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    label: String,
) {
    log::debug!("Session queue {} started", label);
    while let Some(job) = receiver.blocking_recv() {
        if catch_unwind(AssertUnwindSafe(|| job(&mut session))).is_err() {
            log::error!("Job panicked on session queue {}", label);
        }
    }

    if let Err(e) = session.stop_running() {
        log::warn!("Stopping session {} on exit failed: {}", label, e);
    }
    log::debug!("Session queue {} exiting", label);
}
