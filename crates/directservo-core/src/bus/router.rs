//! Response router
//!
//! One reader thread per connection drains the transport, splits the stream
//! into lines and hands every decoded reply to the inbox of the address that
//! sent it. Every reply from a device is also copied to the broadcast inbox.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::inbox::InboxMap;
use crate::protocol::{decode_reply, CommunicationChannel, LineFramer, Reply};

/// Consecutive malformed lines tolerated before the buffers are flushed
pub const MALFORMED_RESYNC_THRESHOLD: u32 = 1;

/// Back-off when the transport reports end of stream
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Deliver a reply to its address inbox, mirroring device replies into broadcast.
pub fn route(inboxes: &InboxMap, reply: Reply) {
    if reply.address.is_broadcast() {
        inboxes.broadcast().push(reply);
        return;
    }
    inboxes.broadcast().push(reply.clone());
    inboxes.get_or_create(reply.address).push(reply);
}

/// Handle to a running reader thread
pub struct ResponseRouter {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ResponseRouter {
    /// Start the reader thread for a connection
    pub fn spawn(
        transport_id: &str,
        reader: Box<dyn CommunicationChannel>,
        inboxes: Arc<InboxMap>,
    ) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let worker = RouterWorker {
            transport_id: transport_id.to_string(),
            reader,
            inboxes,
            framer: LineFramer::new(),
            malformed_streak: 0,
            running: running.clone(),
        };

        let thread = thread::Builder::new()
            .name(format!("servo-router-{}", transport_id))
            .spawn(move || worker.run())?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    /// True while the reader thread is alive and has not been asked to stop
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the thread to exit after its current read
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for ResponseRouter {
    fn drop(&mut self) {
        self.stop();
        // Detach: the thread exits on its own once the current read times out
        self.thread.take();
    }
}

struct RouterWorker {
    transport_id: String,
    reader: Box<dyn CommunicationChannel>,
    inboxes: Arc<InboxMap>,
    framer: LineFramer,
    malformed_streak: u32,
    running: Arc<AtomicBool>,
}

impl RouterWorker {
    fn run(mut self) {
        tracing::debug!(transport = %self.transport_id, "response router started");
        let mut buffer = [0u8; 256];

        while self.running.load(Ordering::Relaxed) {
            match self.reader.read(&mut buffer) {
                Ok(0) => thread::sleep(IDLE_POLL),
                Ok(n) => self.handle_bytes(&buffer[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    tracing::error!(
                        transport = %self.transport_id,
                        "response router stopping after read error: {}",
                        e
                    );
                    self.running.store(false, Ordering::Relaxed);
                }
            }
        }

        tracing::debug!(transport = %self.transport_id, "response router stopped");
    }

    fn handle_bytes(&mut self, bytes: &[u8]) {
        for line in self.framer.push(bytes) {
            if line.iter().all(|&b| b == b'\r') {
                continue;
            }

            let reply = decode_reply(&line);
            let malformed = reply.is_malformed();
            tracing::debug!(transport = %self.transport_id, "routing reply {:?}", reply);
            route(&self.inboxes, reply);

            if !malformed {
                self.malformed_streak = 0;
                continue;
            }

            self.malformed_streak += 1;
            tracing::warn!(
                transport = %self.transport_id,
                "received unrecognized response: {:?}",
                String::from_utf8_lossy(&line)
            );
            if self.malformed_streak >= MALFORMED_RESYNC_THRESHOLD {
                self.resync();
                // Whatever else arrived in this chunk belongs to the garbled stream
                return;
            }
        }
    }

    fn resync(&mut self) {
        tracing::warn!(transport = %self.transport_id, "flushing buffers to resynchronize framing");
        self.framer.reset();
        self.malformed_streak = 0;
        if let Err(e) = self.reader.discard_all() {
            tracing::warn!(transport = %self.transport_id, "failed to flush buffers: {}", e);
        }
    }
}
