//! Per-agent experience storage.
//!
//! Episodes stay contiguous: the ring evicts whole episodes from the oldest
//! end, never a partial prefix, so every flushed rollout carries exactly one
//! terminal flag at its end.

use std::collections::VecDeque;

/// One tick's experience tuple.
#[derive(Debug, Clone)]
pub struct Experience {
    pub state: Vec<f32>,
    pub action: usize,
    pub log_prob: f32,
    pub value: f32,
    pub reward: f32,
    pub done: bool,
}

#[derive(Debug, Default)]
pub struct BufferStats {
    pub dropped_episodes: u64,
    pub dropped_steps: u64,
}

pub struct ExperienceBuffer {
    capacity: usize,
    /// Closed episodes plus, at the back, the currently open one (if any).
    episodes: VecDeque<Vec<Experience>>,
    open: bool,
    len: usize,
    stats: BufferStats,
}

impl ExperienceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            episodes: VecDeque::new(),
            open: false,
            len: 0,
            stats: BufferStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Appends in tick order. A `done` step closes the current episode.
    pub fn push(&mut self, exp: Experience) {
        if !self.open {
            self.episodes.push_back(Vec::new());
            self.open = true;
        }
        let done = exp.done;
        if let Some(current) = self.episodes.back_mut() {
            current.push(exp);
        }
        self.len += 1;
        if done {
            self.open = false;
        }
        self.enforce_capacity();
    }

    fn enforce_capacity(&mut self) {
        while self.len > self.capacity {
            if self.episodes.len() == 1 && self.open {
                // A single runaway open episode: discard it entirely rather
                // than tearing its prefix off.
                if let Some(episode) = self.episodes.pop_front() {
                    self.len -= episode.len();
                    self.stats.dropped_steps += episode.len() as u64;
                    self.stats.dropped_episodes += 1;
                }
                self.open = false;
                break;
            }
            match self.episodes.pop_front() {
                Some(episode) => {
                    self.len -= episode.len();
                    self.stats.dropped_steps += episode.len() as u64;
                    self.stats.dropped_episodes += 1;
                }
                None => break,
            }
        }
    }

    /// Number of steps sitting in closed episodes.
    pub fn closed_len(&self) -> usize {
        let open_len = if self.open {
            self.episodes.back().map(|e| e.len()).unwrap_or(0)
        } else {
            0
        };
        self.len - open_len
    }

    /// Moves out every closed episode. The open episode, if any, stays.
    pub fn take_closed(&mut self) -> Vec<Vec<Experience>> {
        let keep_back = self.open;
        let closed_count = if keep_back {
            self.episodes.len().saturating_sub(1)
        } else {
            self.episodes.len()
        };
        let mut out = Vec::with_capacity(closed_count);
        for _ in 0..closed_count {
            if let Some(episode) = self.episodes.pop_front() {
                self.len -= episode.len();
                out.push(episode);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(reward: f32, done: bool) -> Experience {
        Experience {
            state: vec![0.0; 4],
            action: 0,
            log_prob: -1.0,
            value: 0.0,
            reward,
            done,
        }
    }

    fn fill_episode(buf: &mut ExperienceBuffer, steps: usize) {
        for i in 0..steps {
            buf.push(step(i as f32, i == steps - 1));
        }
    }

    #[test]
    fn closed_episodes_have_exactly_one_terminal_at_end() {
        let mut buf = ExperienceBuffer::new(100);
        fill_episode(&mut buf, 5);
        fill_episode(&mut buf, 3);
        let episodes = buf.take_closed();
        assert_eq!(episodes.len(), 2);
        for episode in &episodes {
            let terminals = episode.iter().filter(|e| e.done).count();
            assert_eq!(terminals, 1);
            assert!(episode.last().unwrap().done);
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn open_episode_survives_flush() {
        let mut buf = ExperienceBuffer::new(100);
        fill_episode(&mut buf, 4);
        buf.push(step(0.0, false));
        buf.push(step(1.0, false));
        let closed = buf.take_closed();
        assert_eq!(closed.len(), 1);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.closed_len(), 0);
    }

    #[test]
    fn eviction_drops_whole_oldest_episode() {
        let mut buf = ExperienceBuffer::new(10);
        fill_episode(&mut buf, 6);
        fill_episode(&mut buf, 6);
        // Capacity 10 < 12: the first episode must be gone as a unit.
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.stats().dropped_episodes, 1);
        assert_eq!(buf.stats().dropped_steps, 6);
        let episodes = buf.take_closed();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].len(), 6);
        // The survivor is the newer episode.
        assert_eq!(episodes[0][0].reward, 0.0);
        assert!(episodes[0].last().unwrap().done);
    }

    #[test]
    fn runaway_open_episode_is_discarded_whole() {
        let mut buf = ExperienceBuffer::new(5);
        for _ in 0..6 {
            buf.push(step(0.0, false));
        }
        assert!(buf.is_empty());
        assert_eq!(buf.stats().dropped_episodes, 1);
        // The buffer accepts a fresh episode afterwards.
        fill_episode(&mut buf, 3);
        assert_eq!(buf.take_closed().len(), 1);
    }

    #[test]
    fn steps_remain_in_tick_order() {
        let mut buf = ExperienceBuffer::new(100);
        for i in 0..5 {
            buf.push(step(i as f32, i == 4));
        }
        let episodes = buf.take_closed();
        let rewards: Vec<f32> = episodes[0].iter().map(|e| e.reward).collect();
        assert_eq!(rewards, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }
}
