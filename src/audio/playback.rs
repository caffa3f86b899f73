//! Playback queue for inbound agent audio
//!
//! Holds decoded chunks in arrival order plus a single "current" slot. The
//! queue never touches the output device itself: it hands back the chunk
//! that should start next and expects exactly one completion per started
//! chunk, delivered through the session event loop. Draining is therefore
//! iterative, one completion event per chunk, with no callback chaining.

use std::collections::VecDeque;

use super::pcm::DecodedAudio;

/// A chunk with the id used to match its completion event
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedChunk {
    pub id: u64,
    pub audio: DecodedAudio,
}

/// FIFO of not-yet-played chunks with one playing slot
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    pending: VecDeque<QueuedChunk>,
    current: Option<u64>,
    next_id: u64,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a chunk. Returns it back if nothing was playing, meaning the
    /// caller must start it now.
    pub fn enqueue(&mut self, audio: DecodedAudio) -> Option<QueuedChunk> {
        let chunk = QueuedChunk {
            id: self.next_id,
            audio,
        };
        self.next_id += 1;

        if self.current.is_none() {
            self.current = Some(chunk.id);
            Some(chunk)
        } else {
            self.pending.push_back(chunk);
            None
        }
    }

    /// Mark chunk `id` as finished and return the next chunk to start.
    ///
    /// Completions for anything other than the current chunk are stale
    /// (typically a chunk that was interrupted) and are ignored.
    pub fn complete(&mut self, id: u64) -> Option<QueuedChunk> {
        if self.current != Some(id) {
            log::debug!(
                "PlaybackQueue: ignoring stale completion for chunk {} (current: {:?})",
                id,
                self.current
            );
            return None;
        }

        self.current = None;
        let next = self.pending.pop_front()?;
        self.current = Some(next.id);
        Some(next)
    }

    /// Drop the playing chunk and everything queued behind it.
    /// Returns true if anything was playing or queued.
    pub fn interrupt(&mut self) -> bool {
        let had_audio = self.current.is_some() || !self.pending.is_empty();
        if had_audio {
            log::debug!(
                "PlaybackQueue: interrupted (current: {:?}, {} queued)",
                self.current,
                self.pending.len()
            );
        }
        self.current = None;
        self.pending.clear();
        had_audio
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<u64> {
        self.current
    }

    /// Number of chunks waiting behind the current one
    pub fn queued(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(marker: f32) -> DecodedAudio {
        DecodedAudio {
            samples: vec![marker; 4],
            sample_rate: 24_000,
        }
    }

    #[test]
    fn test_first_chunk_starts_immediately() {
        let mut queue = PlaybackQueue::new();
        let started = queue.enqueue(audio(0.1)).expect("idle queue starts chunk");
        assert_eq!(started.id, 0);
        assert!(queue.is_playing());
        assert_eq!(queue.queued(), 0);
    }

    #[test]
    fn test_chunks_play_in_arrival_order_one_at_a_time() {
        let mut queue = PlaybackQueue::new();
        let first = queue.enqueue(audio(0.1)).unwrap();
        assert!(queue.enqueue(audio(0.2)).is_none());
        assert!(queue.enqueue(audio(0.3)).is_none());
        assert_eq!(queue.queued(), 2);

        let second = queue.complete(first.id).unwrap();
        assert_eq!(second.audio.samples[0], 0.2);
        assert_eq!(queue.current(), Some(second.id));

        let third = queue.complete(second.id).unwrap();
        assert_eq!(third.audio.samples[0], 0.3);

        assert!(queue.complete(third.id).is_none());
        assert!(!queue.is_playing());
    }

    #[test]
    fn test_enqueue_after_drain_starts_again() {
        let mut queue = PlaybackQueue::new();
        let first = queue.enqueue(audio(0.1)).unwrap();
        assert!(queue.complete(first.id).is_none());

        let next = queue.enqueue(audio(0.2)).unwrap();
        assert_eq!(next.id, 1);
    }

    #[test]
    fn test_interrupt_clears_current_and_pending() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue(audio(0.1));
        queue.enqueue(audio(0.2));
        queue.enqueue(audio(0.3));

        assert!(queue.interrupt());
        assert!(!queue.is_playing());
        assert_eq!(queue.queued(), 0);

        // Nothing left to interrupt
        assert!(!queue.interrupt());
    }

    #[test]
    fn test_stale_completion_after_interrupt_is_ignored() {
        let mut queue = PlaybackQueue::new();
        let interrupted = queue.enqueue(audio(0.1)).unwrap();
        queue.interrupt();

        let fresh = queue.enqueue(audio(0.2)).unwrap();
        queue.enqueue(audio(0.3));

        // Late completion of the interrupted chunk must not skip the fresh one
        assert!(queue.complete(interrupted.id).is_none());
        assert_eq!(queue.current(), Some(fresh.id));
        assert_eq!(queue.queued(), 1);
    }

    #[test]
    fn test_long_queue_drains_without_recursion() {
        let mut queue = PlaybackQueue::new();
        let mut current = queue.enqueue(audio(0.0)).unwrap();
        for _ in 0..10_000 {
            queue.enqueue(audio(0.0));
        }

        let mut played = 1;
        while let Some(next) = queue.complete(current.id) {
            current = next;
            played += 1;
        }
        assert_eq!(played, 10_001);
    }
}
