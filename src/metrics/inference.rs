//! Rolling history of generation sessions
//!
//! Tracks one in-flight session at a time and keeps a bounded FIFO history of
//! completed ones, with windowed averages over the most recent completions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Immutable record of one completed generation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InferenceSession {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub ttft: Duration,
    pub tokens_generated: u32,
    pub total_time: Duration,
    pub tokens_per_second: f32,
    pub prompt_length: usize,
}

/// Current and windowed-average figures
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct InferenceStats {
    pub current_ttft: Duration,
    pub current_tokens_per_sec: f32,
    pub current_latency: Duration,
    pub avg_ttft: Duration,
    pub avg_tokens_per_sec: f32,
    pub avg_latency: Duration,
    pub total_sessions: usize,
    pub total_tokens: u64,
}

struct ActiveSession {
    started: Instant,
    started_at: DateTime<Utc>,
    first_token: Option<Duration>,
    tokens: u32,
    prompt_length: usize,
}

pub struct InferenceMetrics {
    sessions: VecDeque<InferenceSession>,
    current: Option<ActiveSession>,
}

impl InferenceMetrics {
    /// Bounded history; oldest sessions are evicted first
    pub const MAX_SESSIONS: usize = 100;

    /// Averages cover this many of the most recent completed sessions
    pub const STATS_WINDOW: usize = 10;

    pub fn new() -> Self {
        Self {
            sessions: VecDeque::with_capacity(Self::MAX_SESSIONS),
            current: None,
        }
    }

    /// Begin tracking a session. Replaces any unfinished one.
    pub fn start_session(&mut self, prompt_length: usize) {
        self.current = Some(ActiveSession {
            started: Instant::now(),
            started_at: Utc::now(),
            first_token: None,
            tokens: 0,
            prompt_length,
        });
        debug!("Inference session started, prompt length: {}", prompt_length);
    }

    /// Latch time-to-first-token. Only the first call per session has effect.
    pub fn record_first_token(&mut self) {
        if let Some(current) = &mut self.current {
            if current.first_token.is_none() {
                let ttft = current.started.elapsed();
                current.first_token = Some(ttft);
                debug!("First token: {:.0}ms", ttft.as_secs_f64() * 1000.0);
            }
        }
    }

    pub fn record_token(&mut self) {
        if let Some(current) = &mut self.current {
            current.tokens += 1;
        }
    }

    /// Close the in-flight session and append it to history.
    /// Returns `None` if no session was started.
    pub fn end_session(&mut self) -> Option<InferenceSession> {
        let current = self.current.take()?;

        let total_time = current.started.elapsed();
        let tokens_per_second = if total_time.is_zero() {
            0.0
        } else {
            current.tokens as f32 / total_time.as_secs_f32()
        };

        let session = InferenceSession {
            started_at: current.started_at,
            ended_at: Utc::now(),
            ttft: current.first_token.unwrap_or_default(),
            tokens_generated: current.tokens,
            total_time,
            tokens_per_second,
            prompt_length: current.prompt_length,
        };

        if self.sessions.len() >= Self::MAX_SESSIONS {
            self.sessions.pop_front();
        }
        self.sessions.push_back(session);

        debug!(
            "Session ended: {} tokens in {:.0}ms ({:.2} tok/s)",
            session.tokens_generated,
            total_time.as_secs_f64() * 1000.0,
            tokens_per_second
        );

        Some(session)
    }

    /// Drop the in-flight session without recording it. Used for aborted or
    /// failed generations, which never become history entries.
    pub fn cancel_session(&mut self) {
        if self.current.take().is_some() {
            debug!("In-flight session discarded");
        }
    }

    /// Current figures (live when a session is active, otherwise the most
    /// recent completed session's) plus averages over the stats window.
    pub fn get_stats(&self) -> InferenceStats {
        let last = self.sessions.back();

        let (current_ttft, current_tokens_per_sec, current_latency) = match &self.current {
            Some(active) => {
                let elapsed = active.started.elapsed();
                let tps = if elapsed.is_zero() {
                    0.0
                } else {
                    active.tokens as f32 / elapsed.as_secs_f32()
                };
                (active.first_token.unwrap_or_default(), tps, elapsed)
            }
            None => last
                .map(|s| (s.ttft, s.tokens_per_second, s.total_time))
                .unwrap_or_default(),
        };

        let window_start = self.sessions.len().saturating_sub(Self::STATS_WINDOW);
        let recent: Vec<&InferenceSession> = self.sessions.iter().skip(window_start).collect();

        let (avg_ttft, avg_tokens_per_sec, avg_latency) = if recent.is_empty() {
            (Duration::ZERO, 0.0, Duration::ZERO)
        } else {
            let n = recent.len() as u32;
            (
                recent.iter().map(|s| s.ttft).sum::<Duration>() / n,
                recent.iter().map(|s| s.tokens_per_second).sum::<f32>() / n as f32,
                recent.iter().map(|s| s.total_time).sum::<Duration>() / n,
            )
        };

        InferenceStats {
            current_ttft,
            current_tokens_per_sec,
            current_latency,
            avg_ttft,
            avg_tokens_per_sec,
            avg_latency,
            total_sessions: self.sessions.len(),
            total_tokens: self.total_tokens(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn total_tokens(&self) -> u64 {
        self.sessions.iter().map(|s| s.tokens_generated as u64).sum()
    }

    /// Clear all history and reset in-flight counters.
    pub fn reset(&mut self) {
        self.sessions.clear();
        self.current = None;
        debug!("Metrics reset");
    }
}

impl Default for InferenceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_session(metrics: &mut InferenceMetrics, prompt_length: usize, tokens: u32) {
        metrics.start_session(prompt_length);
        for _ in 0..tokens {
            metrics.record_first_token();
            metrics.record_token();
        }
        metrics.end_session();
    }

    #[test]
    fn test_history_bounded_at_capacity() {
        let mut metrics = InferenceMetrics::new();

        for i in 0..=InferenceMetrics::MAX_SESSIONS {
            complete_session(&mut metrics, i, 1);
        }

        assert_eq!(metrics.session_count(), InferenceMetrics::MAX_SESSIONS);
        // Session 0 was evicted; the oldest survivor is session 1
        assert_eq!(metrics.sessions.front().unwrap().prompt_length, 1);
        assert_eq!(
            metrics.sessions.back().unwrap().prompt_length,
            InferenceMetrics::MAX_SESSIONS
        );
    }

    #[test]
    fn test_first_token_is_idempotent() {
        let mut metrics = InferenceMetrics::new();
        metrics.start_session(10);

        metrics.record_first_token();
        let first = metrics.current.as_ref().unwrap().first_token.unwrap();

        std::thread::sleep(Duration::from_millis(5));
        metrics.record_first_token();
        assert_eq!(metrics.current.as_ref().unwrap().first_token.unwrap(), first);
    }

    #[test]
    fn test_end_without_start() {
        let mut metrics = InferenceMetrics::new();
        assert!(metrics.end_session().is_none());
    }

    #[test]
    fn test_session_record_fields() {
        let mut metrics = InferenceMetrics::new();
        metrics.start_session(42);
        metrics.record_first_token();
        metrics.record_token();
        metrics.record_token();
        std::thread::sleep(Duration::from_millis(5));

        let session = metrics.end_session().unwrap();
        assert_eq!(session.prompt_length, 42);
        assert_eq!(session.tokens_generated, 2);
        assert!(session.total_time >= Duration::from_millis(5));
        assert!(session.tokens_per_second > 0.0);
        assert!(session.ended_at >= session.started_at);
    }

    #[test]
    fn test_stats_live_during_session() {
        let mut metrics = InferenceMetrics::new();
        metrics.start_session(5);
        metrics.record_first_token();
        metrics.record_token();
        std::thread::sleep(Duration::from_millis(5));

        let stats = metrics.get_stats();
        assert!(stats.current_latency >= Duration::from_millis(5));
        assert!(stats.current_ttft > Duration::ZERO);
        assert!(stats.current_tokens_per_sec > 0.0);
        assert_eq!(stats.total_sessions, 0);
    }

    #[test]
    fn test_stats_fall_back_to_last_session() {
        let mut metrics = InferenceMetrics::new();
        complete_session(&mut metrics, 5, 3);

        let stats = metrics.get_stats();
        let last = metrics.sessions.back().unwrap();
        assert_eq!(stats.current_ttft, last.ttft);
        assert_eq!(stats.current_tokens_per_sec, last.tokens_per_second);
        assert_eq!(stats.current_latency, last.total_time);
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.total_tokens, 3);
    }

    #[test]
    fn test_averages_cover_recent_window_only() {
        let mut metrics = InferenceMetrics::new();

        // 5 older sessions with 1 token, then 10 recent ones with 3 tokens
        for _ in 0..5 {
            complete_session(&mut metrics, 1, 1);
        }
        for _ in 0..InferenceMetrics::STATS_WINDOW {
            complete_session(&mut metrics, 1, 3);
        }

        let stats = metrics.get_stats();
        assert_eq!(stats.total_sessions, 15);
        // All windowed sessions produced 3 tokens, so every token count that
        // feeds the average is 3; totals still count everything
        assert_eq!(stats.total_tokens, 5 + 30);
        let window: Vec<_> = metrics
            .sessions
            .iter()
            .skip(5)
            .map(|s| s.tokens_generated)
            .collect();
        assert!(window.iter().all(|&t| t == 3));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut metrics = InferenceMetrics::new();
        complete_session(&mut metrics, 1, 1);
        metrics.start_session(1);

        metrics.reset();
        assert_eq!(metrics.session_count(), 0);
        assert!(metrics.current.is_none());
        assert_eq!(metrics.get_stats(), InferenceStats::default());
    }
}
