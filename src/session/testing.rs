//! In-memory session and operator I/O doubles for command tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use super::{
    EventMessage, MethodHandler, SendOptions, Session, SessionError, Subscription, TwinState,
};

/// Session that records calls and hands out pre-built subscriptions.
#[derive(Default)]
pub struct FakeSession {
    pub sent: Mutex<Vec<(Vec<u8>, SendOptions)>>,
    pub events: Mutex<Option<Subscription<EventMessage>>>,
    pub twin_updates: Mutex<Option<Subscription<TwinState>>>,
    pub methods: Mutex<HashMap<String, MethodHandler>>,
    pub register_error: Mutex<Option<SessionError>>,
    pub twin: Mutex<(TwinState, TwinState)>,
    pub updates: Mutex<Vec<TwinState>>,
    pub version: AtomicI64,
    /// Cancel to simulate losing the connection.
    pub lost: CancellationToken,
}

impl FakeSession {
    /// Wait until a handler for `name` is registered.
    pub async fn handler(&self, name: &str) -> MethodHandler {
        loop {
            if let Some(h) = self.methods.lock().unwrap().get(name).cloned() {
                return h;
            }
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn send_event(&self, payload: Vec<u8>, opts: SendOptions) -> Result<(), SessionError> {
        self.sent.lock().unwrap().push((payload, opts));
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<Subscription<EventMessage>, SessionError> {
        self.events.lock().unwrap().take().ok_or(SessionError::Closed)
    }

    async fn subscribe_twin_updates(&self) -> Result<Subscription<TwinState>, SessionError> {
        self.twin_updates.lock().unwrap().take().ok_or(SessionError::Closed)
    }

    async fn register_method(
        &self,
        name: &str,
        handler: MethodHandler,
    ) -> Result<(), SessionError> {
        if let Some(err) = self.register_error.lock().unwrap().take() {
            return Err(err);
        }
        self.methods.lock().unwrap().insert(name.to_string(), handler);
        Ok(())
    }

    async fn retrieve_twin_state(&self) -> Result<(TwinState, TwinState), SessionError> {
        Ok(self.twin.lock().unwrap().clone())
    }

    async fn update_twin_state(&self, state: TwinState) -> Result<i64, SessionError> {
        self.updates.lock().unwrap().push(state);
        Ok(self.version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn closed(&self) -> SessionError {
        self.lost.cancelled().await;
        SessionError::ConnectionLost("connection reset by peer".into())
    }
}

/// Shared, ordered log of operator I/O events.
pub type IoLog = Arc<Mutex<Vec<String>>>;

/// Operator input that yields exactly one scripted line per read and logs it.
pub struct ScriptedInput {
    lines: VecDeque<String>,
    log: IoLog,
}

impl ScriptedInput {
    pub fn new(lines: &[&str], log: IoLog) -> Self {
        Self {
            lines: lines.iter().map(|l| format!("{l}\n")).collect(),
            log,
        }
    }
}

impl AsyncRead for ScriptedInput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(line) = self.lines.pop_front() {
            self.log
                .lock()
                .unwrap()
                .push(format!("read:{}", line.trim_end()));
            buf.put_slice(line.as_bytes());
        }
        // Nothing put = end of input.
        Poll::Ready(Ok(()))
    }
}

/// Operator output that yields once before every write, then logs it.
pub struct RecordingOutput {
    log: IoLog,
    ready: bool,
}

impl RecordingOutput {
    pub fn new(log: IoLog) -> Self {
        Self { log, ready: false }
    }

    /// Everything written so far, concatenated.
    pub fn written(log: &IoLog) -> String {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.strip_prefix("write:"))
            .collect()
    }
}

impl AsyncWrite for RecordingOutput {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !self.ready {
            self.ready = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        self.ready = false;
        self.log
            .lock()
            .unwrap()
            .push(format!("write:{}", String::from_utf8_lossy(buf)));
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
