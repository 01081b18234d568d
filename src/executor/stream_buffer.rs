// Per-command output buffering with ordered, serialized flushes
//
// Incoming text is coalesced and written to the store either immediately
// on reaching the size threshold or on a periodic timer (short initial
// delay for low time-to-first-chunk, then a steady cadence). At most one
// flush is in flight per command; anything arriving mid-flush is marked
// pending and flushed right after, so the store never sees overlapping
// or out-of-order writes for one command. A failed store write is
// prepended back in front of newer content: delivery is at-least-once,
// ordered strictly by original write time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::storage::CommandStore;

/// Buffered characters that trigger an immediate flush.
pub const FLUSH_THRESHOLD_CHARS: usize = 1024;

/// Delay before the first periodic flush.
pub const FIRST_FLUSH_DELAY_MS: u64 = 250;

/// Steady flush cadence after the first flush.
pub const FLUSH_INTERVAL_MS: u64 = 1000;

/// Pause before the final sentinel chunk so live observers catch the
/// last content chunk first.
pub const FINAL_CHUNK_DELAY_MS: u64 = 150;

/// Flush attempts during `end` before giving up on re-queued content.
const END_FLUSH_ATTEMPTS: usize = 3;

#[derive(Default)]
struct BufferState {
    buf: String,
    flushing: bool,
    pending: bool,
    stopped: bool,
}

/// Output accumulator for one command.
///
/// Cheap to clone; all clones share the same buffer state.
#[derive(Clone)]
pub struct StreamBuffer {
    command_id: String,
    store: Arc<dyn CommandStore>,
    state: Arc<Mutex<BufferState>>,
    timer: Arc<Mutex<Option<JoinHandle<()>>>>,
    stop: Arc<Notify>,
    first_delay: Duration,
    interval: Duration,
    final_delay: Duration,
}

impl StreamBuffer {
    pub fn new(store: Arc<dyn CommandStore>, command_id: &str) -> Self {
        Self {
            command_id: command_id.to_string(),
            store,
            state: Arc::new(Mutex::new(BufferState::default())),
            timer: Arc::new(Mutex::new(None)),
            stop: Arc::new(Notify::new()),
            first_delay: Duration::from_millis(FIRST_FLUSH_DELAY_MS),
            interval: Duration::from_millis(FLUSH_INTERVAL_MS),
            final_delay: Duration::from_millis(FINAL_CHUNK_DELAY_MS),
        }
    }

    /// Override the flush timings. Timing-sensitive tests only.
    pub fn with_timings(mut self, first_delay: Duration, interval: Duration, final_delay: Duration) -> Self {
        self.first_delay = first_delay;
        self.interval = interval;
        self.final_delay = final_delay;
        self
    }

    /// Begin the periodic flush schedule. Calling twice is a no-op.
    pub fn start(&self) {
        let mut timer = self.timer.lock().unwrap();
        if timer.is_some() {
            return;
        }

        let buffer = self.clone();
        *timer = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(buffer.first_delay) => {}
                _ = buffer.stop.notified() => return,
            }
            loop {
                if buffer.state.lock().unwrap().stopped {
                    break;
                }
                buffer.flush().await;
                tokio::select! {
                    _ = tokio::time::sleep(buffer.interval) => {}
                    _ = buffer.stop.notified() => break,
                }
            }
        }));
    }

    /// Append text, flushing immediately once the size threshold is hit.
    pub async fn write(&self, text: &str) {
        let hit_threshold = {
            let mut state = self.state.lock().unwrap();
            state.buf.push_str(text);
            state.buf.len() >= FLUSH_THRESHOLD_CHARS
        };
        if hit_threshold {
            self.flush().await;
        }
    }

    /// Flush buffered content to the store.
    ///
    /// If another flush is already in flight the new data is only marked
    /// pending; the in-flight flush picks it up immediately on
    /// completion, before the periodic schedule resumes.
    pub async fn flush(&self) {
        loop {
            let content = {
                let mut state = self.state.lock().unwrap();
                if state.flushing {
                    if !state.buf.is_empty() {
                        state.pending = true;
                    }
                    return;
                }
                if state.buf.is_empty() {
                    return;
                }
                state.flushing = true;
                std::mem::take(&mut state.buf)
            };

            let result = self
                .store
                .append_chunk(&self.command_id, &content, false)
                .await;

            let flush_pending = {
                let mut state = self.state.lock().unwrap();
                state.flushing = false;
                match result {
                    Ok(()) => {
                        let pending = state.pending;
                        state.pending = false;
                        pending
                    }
                    Err(e) => {
                        // Re-queue ahead of newer content: strict FIFO
                        // by original write time, retried next flush
                        log::warn!(
                            "[StreamBuffer] Flush failed for command {}, re-queueing {} chars: {}",
                            self.command_id,
                            content.len(),
                            e
                        );
                        let newer = std::mem::take(&mut state.buf);
                        state.buf = content;
                        state.buf.push_str(&newer);
                        state.pending = false;
                        false
                    }
                }
            };

            if !flush_pending {
                return;
            }
        }
    }

    /// Finalize the stream: stop the timer, flush the remainder, give
    /// live observers a moment, then write the terminal sentinel chunk.
    /// Safe to call without a prior `start`.
    pub async fn end(&self, exit_code: i32) {
        {
            let mut state = self.state.lock().unwrap();
            state.stopped = true;
        }
        // Never abort the timer task: a flush may be mid-write with the
        // content already taken out of the buffer. Signal it to stop and
        // wait for it to finish.
        self.stop.notify_one();
        let timer = self.timer.lock().unwrap().take();
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                log::debug!(
                    "[StreamBuffer] Timer task for command {} ended abnormally: {}",
                    self.command_id,
                    e
                );
            }
        }

        for _ in 0..END_FLUSH_ATTEMPTS {
            while self.state.lock().unwrap().flushing {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.flush().await;
            if self.state.lock().unwrap().buf.is_empty() {
                break;
            }
        }
        {
            let state = self.state.lock().unwrap();
            if !state.buf.is_empty() {
                log::error!(
                    "[StreamBuffer] {} chars still unflushed for command {} at end (exit {})",
                    state.buf.len(),
                    self.command_id,
                    exit_code
                );
            }
        }

        tokio::time::sleep(self.final_delay).await;

        if let Err(e) = self.store.append_chunk(&self.command_id, "", true).await {
            log::error!(
                "[StreamBuffer] Failed to write final chunk for command {}: {}",
                self.command_id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn fast_buffer(store: &Arc<InMemoryStore>, command_id: &str) -> StreamBuffer {
        StreamBuffer::new(store.clone() as Arc<dyn CommandStore>, command_id).with_timings(
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_periodic_flush_and_final_chunk() {
        let store = Arc::new(InMemoryStore::new());
        let buffer = fast_buffer(&store, "c1");
        buffer.start();

        buffer.write("hel").await;
        buffer.write("lo").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.reconstructed_output("c1"), "hello");

        buffer.write(" world").await;
        buffer.end(0).await;

        assert_eq!(store.reconstructed_output("c1"), "hello world");
        let chunks = store.chunks_for("c1");
        let finals: Vec<_> = chunks.iter().filter(|c| c.is_final).collect();
        assert_eq!(finals.len(), 1);
        assert!(chunks.last().unwrap().is_final);
    }

    #[tokio::test]
    async fn test_threshold_triggers_immediate_flush() {
        let store = Arc::new(InMemoryStore::new());
        // No timer started at all; only the threshold can flush
        let buffer = fast_buffer(&store, "c1");

        let big = "x".repeat(FLUSH_THRESHOLD_CHARS);
        buffer.write(&big).await;
        assert_eq!(store.reconstructed_output("c1"), big);
    }

    #[tokio::test]
    async fn test_flushes_never_overlap() {
        let store = Arc::new(InMemoryStore::new());
        store.set_append_delay(Duration::from_millis(30));
        let buffer = fast_buffer(&store, "c1");
        buffer.start();

        // Hammer the buffer from several writers while flushes are slow
        let mut tasks = Vec::new();
        for i in 0..4 {
            let buffer = buffer.clone();
            tasks.push(tokio::spawn(async move {
                for j in 0..10 {
                    buffer.write(&format!("[{}:{}]", i, j)).await;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        buffer.end(0).await;

        assert_eq!(store.max_concurrent_appends(), 1);
        // Every write made it out exactly once
        let output = store.reconstructed_output("c1");
        for i in 0..4 {
            for j in 0..10 {
                let marker = format!("[{}:{}]", i, j);
                assert_eq!(output.matches(&marker).count(), 1, "missing {}", marker);
            }
        }
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_ahead_of_newer_content() {
        let store = Arc::new(InMemoryStore::new());
        let buffer = fast_buffer(&store, "c1");

        store.fail_next_appends(1);
        buffer.write("abc").await;
        buffer.flush().await; // fails, abc re-queued
        assert_eq!(store.reconstructed_output("c1"), "");

        buffer.write("def").await;
        buffer.flush().await;
        assert_eq!(store.reconstructed_output("c1"), "abcdef");
    }

    #[tokio::test]
    async fn test_end_waits_for_in_flight_timer_flush() {
        let store = Arc::new(InMemoryStore::new());
        store.set_append_delay(Duration::from_millis(200));
        let buffer = fast_buffer(&store, "c1");
        buffer.start();

        buffer.write("abc").await;
        // Let the timer flush begin its slow store write, then finalize
        // while it is still in flight
        tokio::time::sleep(Duration::from_millis(40)).await;
        buffer.end(0).await;

        assert_eq!(store.reconstructed_output("c1"), "abc");
        let chunks = store.chunks_for("c1");
        assert!(chunks.last().unwrap().is_final);
    }

    #[tokio::test]
    async fn test_end_without_start_is_safe() {
        let store = Arc::new(InMemoryStore::new());
        let buffer = fast_buffer(&store, "c1");
        buffer.end(1).await;

        let chunks = store.chunks_for("c1");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
    }

    #[tokio::test]
    async fn test_pending_data_flushed_after_in_flight_completes() {
        let store = Arc::new(InMemoryStore::new());
        store.set_append_delay(Duration::from_millis(50));
        let buffer = fast_buffer(&store, "c1");

        // First flush holds the in-flight slot for 50ms
        let slow = buffer.clone();
        let first = tokio::spawn(async move {
            slow.write(&"a".repeat(FLUSH_THRESHOLD_CHARS)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // This write lands mid-flush and must not start a second one
        buffer.write(&"b".repeat(FLUSH_THRESHOLD_CHARS)).await;
        first.await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(store.max_concurrent_appends(), 1);
        let output = store.reconstructed_output("c1");
        assert_eq!(output.len(), 2 * FLUSH_THRESHOLD_CHARS);
        // Order preserved: all a's strictly before all b's
        assert!(output.find('b').unwrap() > output.rfind('a').unwrap());
    }
}
