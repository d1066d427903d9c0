//! Bounded, line-numbered, multi-subscriber log buffer.
//!
//! One buffer exists per step. The execution task is the single writer;
//! poll/stream handlers and the remote uploader read. Writes never block
//! on slow subscribers.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Retained-line cap. Older lines are discarded on overflow and never
/// re-delivered.
pub const DEFAULT_RETAIN_LINES: usize = 10_000;

/// Capacity of each subscriber channel, in batches.
const SUBSCRIBER_CHANNEL_BATCHES: usize = 256;

/// One log line with its dense, never-reused sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub seq: u64,
    pub text: String,
}

/// What to do with a subscriber whose channel is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubscriberPolicy {
    /// Drop the batch for that subscriber and count the drop.
    #[default]
    DropBatch,
    /// Remove the subscriber entirely.
    Evict,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Vec<Line>>,
}

struct Inner {
    lines: VecDeque<Line>,
    next_seq: u64,
    /// Trailing bytes of an unterminated line, flushed on close.
    partial: Vec<u8>,
    closed: bool,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    dropped_batches: u64,
    retain: usize,
    policy: SubscriberPolicy,
}

/// Handle returned by [`StreamBuffer::subscribe`].
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Vec<Line>>,
}

/// Ordered, bounded in-memory log with snapshot and tail support.
pub struct StreamBuffer {
    inner: Mutex<Inner>,
}

impl StreamBuffer {
    pub fn new() -> Arc<Self> {
        Self::with_retention(DEFAULT_RETAIN_LINES, SubscriberPolicy::default())
    }

    pub fn with_retention(retain: usize, policy: SubscriberPolicy) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                lines: VecDeque::new(),
                next_seq: 0,
                partial: Vec::new(),
                closed: false,
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                dropped_batches: 0,
                retain: retain.max(1),
                policy,
            }),
        })
    }

    /// Append raw bytes. Complete lines are numbered and published; a
    /// trailing partial line is held until the next write or close.
    /// Writes after close are ignored.
    pub fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }

        let mut batch = Vec::new();
        let mut data = std::mem::take(&mut inner.partial);
        data.extend_from_slice(bytes);

        let mut start = 0;
        for i in 0..data.len() {
            if data[i] == b'\n' {
                let raw = &data[start..i];
                let text = String::from_utf8_lossy(raw.strip_suffix(b"\r").unwrap_or(raw));
                let seq = inner.next_seq;
                inner.next_seq += 1;
                batch.push(Line {
                    seq,
                    text: text.into_owned(),
                });
                start = i + 1;
            }
        }
        inner.partial = data[start..].to_vec();

        if !batch.is_empty() {
            Self::publish(&mut inner, batch);
        }
    }

    /// Current retained lines plus the tail position (the next sequence
    /// number), atomic with respect to `write`.
    pub fn snapshot(&self) -> (Vec<Line>, u64) {
        let inner = self.inner.lock();
        (inner.lines.iter().cloned().collect(), inner.next_seq)
    }

    /// Register a subscriber. Batches published after this call arrive on
    /// the returned channel; read the snapshot first to avoid a gap.
    /// On a closed buffer the channel is returned already closed.
    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.inner.lock();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_BATCHES);
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        if !inner.closed {
            inner.subscribers.push(Subscriber { id, tx });
        }
        Subscription { id, rx }
    }

    /// Remove a subscriber; its channel closes.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| s.id != id);
    }

    /// Rewrite retained line text in place. Used for the close-time
    /// masking fallback; sequence numbers are untouched.
    pub fn remask<F: Fn(&str) -> String>(&self, f: F) {
        let mut inner = self.inner.lock();
        for line in inner.lines.iter_mut() {
            line.text = f(&line.text);
        }
    }

    /// Flush the partial line, wake every subscriber, close their
    /// channels. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;

        if !inner.partial.is_empty() {
            let partial = std::mem::take(&mut inner.partial);
            let text = String::from_utf8_lossy(&partial).into_owned();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let batch = vec![Line { seq, text }];
            Self::publish(&mut inner, batch);
        }

        // Dropping the senders closes every subscriber channel.
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Batches discarded because a subscriber channel was full.
    pub fn dropped_batches(&self) -> u64 {
        self.inner.lock().dropped_batches
    }

    fn publish(inner: &mut Inner, batch: Vec<Line>) {
        for line in &batch {
            inner.lines.push_back(line.clone());
        }
        while inner.lines.len() > inner.retain {
            inner.lines.pop_front();
        }

        let policy = inner.policy;
        let mut dropped = 0u64;
        inner.subscribers.retain(|s| match s.tx.try_send(batch.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => match policy {
                SubscriberPolicy::DropBatch => {
                    dropped += 1;
                    true
                }
                SubscriberPolicy::Evict => false,
            },
            // Receiver side is gone.
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        inner.dropped_batches += dropped;
    }
}

impl std::fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StreamBuffer")
            .field("retained", &inner.lines.len())
            .field("next_seq", &inner.next_seq)
            .field("closed", &inner.closed)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lines: &[Line]) -> Vec<&str> {
        lines.iter().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn test_line_splitting_and_numbering() {
        let buf = StreamBuffer::new();
        buf.write(b"one\ntwo\nthr");
        buf.write(b"ee\n");

        let (lines, tail) = buf.snapshot();
        assert_eq!(texts(&lines), vec!["one", "two", "three"]);
        assert_eq!(
            lines.iter().map(|l| l.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(tail, 3);
    }

    #[test]
    fn test_crlf_is_stripped() {
        let buf = StreamBuffer::new();
        buf.write(b"windows line\r\n");
        let (lines, _) = buf.snapshot();
        assert_eq!(texts(&lines), vec!["windows line"]);
    }

    #[test]
    fn test_partial_line_flushed_on_close() {
        let buf = StreamBuffer::new();
        buf.write(b"complete\nno newline");
        let (lines, _) = buf.snapshot();
        assert_eq!(texts(&lines), vec!["complete"]);

        buf.close();
        let (lines, tail) = buf.snapshot();
        assert_eq!(texts(&lines), vec!["complete", "no newline"]);
        assert_eq!(tail, 2);
    }

    #[test]
    fn test_retention_drops_oldest() {
        let buf = StreamBuffer::with_retention(3, SubscriberPolicy::DropBatch);
        for i in 0..5 {
            buf.write(format!("line{i}\n").as_bytes());
        }
        let (lines, tail) = buf.snapshot();
        assert_eq!(texts(&lines), vec!["line2", "line3", "line4"]);
        // Sequence numbers keep counting past evicted lines.
        assert_eq!(lines[0].seq, 2);
        assert_eq!(tail, 5);
    }

    #[tokio::test]
    async fn test_subscriber_receives_batches_then_close() {
        let buf = StreamBuffer::new();
        buf.write(b"before\n");

        let (snapshot, _) = buf.snapshot();
        let mut sub = buf.subscribe();
        buf.write(b"after one\nafter two\n");
        buf.close();

        let mut received = Vec::new();
        while let Some(batch) = sub.rx.recv().await {
            received.extend(batch);
        }
        assert_eq!(texts(&snapshot), vec!["before"]);
        assert_eq!(texts(&received), vec!["after one", "after two"]);
    }

    #[tokio::test]
    async fn test_subscribe_after_close_yields_closed_channel() {
        let buf = StreamBuffer::new();
        buf.write(b"x\n");
        buf.close();
        let mut sub = buf.subscribe();
        assert!(sub.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let buf = StreamBuffer::new();
        buf.write(b"tail");
        buf.close();
        buf.close();
        let (lines, tail) = buf.snapshot();
        assert_eq!(texts(&lines), vec!["tail"]);
        assert_eq!(tail, 1);
    }

    #[test]
    fn test_write_after_close_ignored() {
        let buf = StreamBuffer::new();
        buf.close();
        buf.write(b"late\n");
        let (lines, tail) = buf.snapshot();
        assert!(lines.is_empty());
        assert_eq!(tail, 0);
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_batches_without_blocking() {
        let buf = StreamBuffer::new();
        let _sub = buf.subscribe();
        // Overrun the channel; writes must not block or fail.
        for i in 0..(SUBSCRIBER_CHANNEL_BATCHES + 50) {
            buf.write(format!("{i}\n").as_bytes());
        }
        assert!(buf.dropped_batches() >= 50);
    }

    #[tokio::test]
    async fn test_evict_policy_removes_full_subscriber() {
        let buf = StreamBuffer::with_retention(DEFAULT_RETAIN_LINES, SubscriberPolicy::Evict);
        let mut sub = buf.subscribe();
        for i in 0..(SUBSCRIBER_CHANNEL_BATCHES + 10) {
            buf.write(format!("{i}\n").as_bytes());
        }
        // The channel closes once the subscriber is evicted; drain what
        // was queued and expect the stream to end.
        let mut got = 0;
        while sub.rx.recv().await.is_some() {
            got += 1;
        }
        assert!(got <= SUBSCRIBER_CHANNEL_BATCHES);
    }

    #[test]
    fn test_remask_rewrites_in_place() {
        let buf = StreamBuffer::new();
        buf.write(b"hello secret\n");
        buf.remask(|s| s.replace("secret", "******"));
        let (lines, _) = buf.snapshot();
        assert_eq!(texts(&lines), vec!["hello ******"]);
        assert_eq!(lines[0].seq, 0);
    }

    #[tokio::test]
    async fn test_stream_completeness_snapshot_plus_batches() {
        let buf = StreamBuffer::new();
        let (snapshot, _) = buf.snapshot();
        let mut sub = buf.subscribe();

        for i in 0..100 {
            buf.write(format!("line {i}\n").as_bytes());
        }
        buf.close();

        let mut all: Vec<Line> = snapshot;
        while let Some(batch) = sub.rx.recv().await {
            all.extend(batch);
        }
        assert_eq!(all.len(), 100);
        for (i, line) in all.iter().enumerate() {
            assert_eq!(line.seq, i as u64);
            assert_eq!(line.text, format!("line {i}"));
        }
    }
}
