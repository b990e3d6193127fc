//! Per-queue runtime counters.
//!
//! Every counter is best-effort and process-local: each side of the queue
//! owns its own instance and updates it through `&mut self`, so plain `u64`
//! fields suffice. Nothing here is observable by the remote side.

use std::fmt;

/// Counter block kept by each queue instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    /// Total `enqueue` calls, accepted or not.
    pub enqueue_calls: u64,
    /// Total `dequeue` calls, successful or not.
    pub dequeue_calls: u64,
    /// Cache-bypassing reads of the shared tail line (producer).
    pub tail_reads: u64,
    /// Enqueues rejected because the ring was full after a tail refresh.
    pub queue_full: u64,
    /// Dequeue polls that found no new entry (epoch mismatch).
    pub not_ready: u64,
    /// Dequeue polls that saw a line whose bytes did not fold to zero.
    pub checksum_failed: u64,
    /// Shared-tail publications performed by the consumer.
    pub tail_flushes: u64,
    /// Producer back-off pauses taken.
    pub producer_backoff_events: u64,
    /// Total cycles the producer spent pausing.
    pub producer_backoff_cycles: u64,
    /// Consumer back-off pauses taken (empty and torn combined).
    pub consumer_backoff_events: u64,
    /// Total cycles the consumer spent pausing.
    pub consumer_backoff_cycles: u64,
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "enqueue calls        : {}", self.enqueue_calls)?;
        writeln!(f, "dequeue calls        : {}", self.dequeue_calls)?;
        writeln!(f, "shared-tail reads (P): {}", self.tail_reads)?;
        writeln!(f, "queue-full events (P): {}", self.queue_full)?;
        writeln!(f, "not-ready polls (C)  : {}", self.not_ready)?;
        writeln!(f, "checksum failures (C): {}", self.checksum_failed)?;
        writeln!(f, "tail flushes (C)     : {}", self.tail_flushes)?;
        writeln!(
            f,
            "producer back-off    : {} pauses / {} cycles",
            self.producer_backoff_events, self.producer_backoff_cycles
        )?;
        write!(
            f,
            "consumer back-off    : {} pauses / {} cycles",
            self.consumer_backoff_events, self.consumer_backoff_cycles
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_renders_every_counter() {
        let m = Metrics {
            enqueue_calls: 10,
            dequeue_calls: 9,
            tail_reads: 2,
            queue_full: 1,
            not_ready: 3,
            checksum_failed: 1,
            tail_flushes: 2,
            producer_backoff_events: 1,
            producer_backoff_cycles: 128,
            consumer_backoff_events: 4,
            consumer_backoff_cycles: 750,
        };
        let rendered = m.to_string();
        for needle in ["10", "9", "128", "750", "tail flushes"] {
            assert!(rendered.contains(needle), "missing {needle} in {rendered}");
        }
    }
}
