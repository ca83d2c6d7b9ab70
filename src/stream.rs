//! Byte streams reconstructed from TCP and the monitors reading them.
//!
//! A [`StreamPipe`] is the hand-off between the capture thread (writer) and
//! a worker parsing application messages (reader). A
//! [`NetworkStreamMonitor`] owns one pipe and one worker per direction of a
//! connection; an [`HttpConversation`] pairs what the two directions read.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::http::{HttpMessage, HttpReader};
use crate::worker::Worker;

/// Result of reading one message from a stream.
///
/// The end of a stream is an outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<T> {
    Message(T),
    Closed,
}

/// Reads consecutive application messages from a byte stream.
pub trait MessageReader: Send {
    type Message;

    fn read_message(&mut self) -> io::Result<ReadOutcome<Self::Message>>;
}

/// Direction of a stream relative to the connection initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Bytes a pipe buffers for a slow reader by default.
pub const DEFAULT_PIPE_CAPACITY: usize = 4 * 1024 * 1024;

#[derive(Debug, Default)]
struct PipeState {
    buffer: VecDeque<u8>,
    closed: bool,
    overflowed: bool,
}

#[derive(Debug)]
struct PipeShared {
    state: Mutex<PipeState>,
    readable: Condvar,
    capacity: usize,
}

/// Bounded blocking byte pipe. Clones share the same pipe.
///
/// Readers block until data arrives or the pipe is closed; after closing,
/// buffered bytes are still delivered before end-of-stream. A write that
/// would exceed the capacity is dropped and closes the pipe, since the
/// stream has a gap from then on.
#[derive(Debug, Clone)]
pub struct StreamPipe {
    shared: Arc<PipeShared>,
}

impl Default for StreamPipe {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PIPE_CAPACITY)
    }
}

impl StreamPipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(PipeShared {
                state: Mutex::new(PipeState::default()),
                readable: Condvar::new(),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Appends bytes for the reader.
    ///
    /// # Returns
    /// - `Ok(())` - The bytes were queued
    /// - `Err(io::Error)` - `BrokenPipe` if the pipe is closed, `OutOfMemory`
    ///   if the bytes were dropped because the buffer is full
    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream pipe is closed"));
        }
        if state.buffer.len() + bytes.len() > self.shared.capacity {
            state.closed = true;
            state.overflowed = true;
            self.shared.readable.notify_all();
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "stream pipe is full"));
        }
        state.buffer.extend(bytes);
        self.shared.readable.notify_all();
        Ok(())
    }

    /// True if the pipe was closed because a write did not fit.
    pub fn overflowed(&self) -> bool {
        self.shared.state.lock().overflowed
    }

    /// Marks the end of the stream and wakes blocked readers.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.readable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Bytes written but not yet read.
    pub fn available(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// A blocking [`Read`] view of the pipe.
    pub fn reader(&self) -> PipeReader {
        PipeReader { pipe: self.clone() }
    }
}

/// Reading end of a [`StreamPipe`].
#[derive(Debug, Clone)]
pub struct PipeReader {
    pipe: StreamPipe,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let shared = &self.pipe.shared;
        let mut state = shared.state.lock();
        while state.buffer.is_empty() && !state.closed {
            shared.readable.wait(&mut state);
        }
        let count = buf.len().min(state.buffer.len());
        for (slot, byte) in buf.iter_mut().zip(state.buffer.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

/// A completed request/response pair.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpExchange {
    pub request: HttpMessage,
    pub response: HttpMessage,
}

#[derive(Debug, Default)]
struct ConversationState {
    requests: VecDeque<HttpMessage>,
    responses: VecDeque<HttpMessage>,
    exchanges: Vec<HttpExchange>,
}

/// Pairs HTTP requests with responses in FIFO order.
///
/// A response seen before its request waits for it.
#[derive(Debug, Default)]
pub struct HttpConversation {
    state: Mutex<ConversationState>,
}

impl HttpConversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request, completing an exchange if a response is waiting.
    pub fn add_request(&self, request: HttpMessage) -> Option<HttpExchange> {
        let mut state = self.state.lock();
        match state.responses.pop_front() {
            Some(response) => Some(Self::complete(&mut state, request, response)),
            None => {
                state.requests.push_back(request);
                None
            }
        }
    }

    /// Records a response, completing an exchange if a request is waiting.
    pub fn add_response(&self, response: HttpMessage) -> Option<HttpExchange> {
        let mut state = self.state.lock();
        match state.requests.pop_front() {
            Some(request) => Some(Self::complete(&mut state, request, response)),
            None => {
                state.responses.push_back(response);
                None
            }
        }
    }

    fn complete(state: &mut ConversationState, request: HttpMessage, response: HttpMessage) -> HttpExchange {
        let exchange = HttpExchange { request, response };
        state.exchanges.push(exchange.clone());
        exchange
    }

    pub fn exchanges(&self) -> Vec<HttpExchange> {
        self.state.lock().exchanges.clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn pending_responses(&self) -> usize {
        self.state.lock().responses.len()
    }
}

/// Watches both directions of one connection.
///
/// Each direction gets a [`StreamPipe`] fed by the capture side and a
/// worker thread reading messages from it. Stopping closes both pipes,
/// which unblocks the workers, then joins them.
#[derive(Debug)]
pub struct NetworkStreamMonitor {
    name: String,
    client: StreamPipe,
    server: StreamPipe,
    workers: Mutex<Vec<Worker>>,
}

impl NetworkStreamMonitor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: StreamPipe::new(),
            server: StreamPipe::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pipe carrying the bytes sent in `direction`.
    pub fn pipe(&self, direction: Direction) -> &StreamPipe {
        match direction {
            Direction::ClientToServer => &self.client,
            Direction::ServerToClient => &self.server,
        }
    }

    /// Starts one reader worker per direction.
    ///
    /// `make_reader` wraps each pipe; every message read is passed to
    /// `on_message` on the worker thread.
    pub fn start<R, M, F>(&self, make_reader: M, on_message: F) -> Result<()>
    where
        R: MessageReader + 'static,
        M: Fn(PipeReader) -> R,
        F: Fn(Direction, R::Message) + Send + Sync + 'static,
    {
        let on_message = Arc::new(on_message);
        let mut workers = self.workers.lock();
        for direction in [Direction::ClientToServer, Direction::ServerToClient] {
            let pipe = self.pipe(direction).clone();
            let mut reader = make_reader(pipe.reader());
            let callback = on_message.clone();
            let name = format!("{}-{:?}", self.name, direction);
            let worker = Worker::spawn(name.clone(), move |_| {
                loop {
                    match reader.read_message() {
                        Ok(ReadOutcome::Message(message)) => callback(direction, message),
                        Ok(ReadOutcome::Closed) => break,
                        Err(err) => {
                            warn!(stream = %name, error = %err, "Stream reader failed");
                            // nobody reads any more; refuse further data
                            pipe.close();
                            break;
                        }
                    }
                }
                debug!(stream = %name, "Stream reader finished");
            })?;
            workers.push(worker);
        }
        Ok(())
    }

    /// Reads HTTP in both directions and reports each completed exchange.
    pub fn start_http<F>(&self, conversation: Arc<HttpConversation>, on_exchange: F) -> Result<()>
    where
        F: Fn(HttpExchange) + Send + Sync + 'static,
    {
        self.start(HttpReader::new, move |direction: Direction, message: HttpMessage| {
            let exchange = match direction {
                Direction::ClientToServer => conversation.add_request(message),
                Direction::ServerToClient => conversation.add_response(message),
            };
            if let Some(exchange) = exchange {
                on_exchange(exchange);
            }
        })
    }

    /// Closes both pipes, then joins the workers.
    pub fn stop(&self) {
        self.client.close();
        self.server.close();
        let workers = std::mem::take(&mut *self.workers.lock());
        for mut worker in workers {
            worker.stop_and_join();
        }
    }

    /// True once both directions have ended.
    pub fn is_finished(&self) -> bool {
        self.workers.lock().iter().all(Worker::is_finished)
    }
}

impl Drop for NetworkStreamMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
