//! Cooperative throttling of long-running attack loops.
//!
//! The engine shares a machine with interactive work, so attack loops
//! volunteer pauses instead of monopolizing a core. A [`SchedulerThrottle`]
//! watches how long each compute slice between safe points takes, grades the
//! recent history, and decides at every checkpoint whether to keep going or
//! to sleep for a bit. The slice budget adapts: smooth recent history earns a
//! longer budget, rough history shrinks it.
//!
//! All state is per session. [`SchedulerThrottle::begin_session`] wipes the
//! history so one pathological run cannot poison the pacing of the next.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::tensor::TensorTracker;

/// Number of recent slice durations kept for grading.
const HISTORY_LEN: usize = 30;

/// Bounds and starting point for the adaptive slice budget.
const MIN_BUDGET: Duration = Duration::from_millis(4);
const MAX_BUDGET: Duration = Duration::from_millis(12);
const DEFAULT_BUDGET: Duration = Duration::from_millis(8);

/// Longest voluntary pause.
const MAX_SLEEP: Duration = Duration::from_millis(16);

/// Memory pressure above which the throttle yields regardless of timing.
const PRESSURE_YIELD: f32 = 0.7;

/// Effective slice rate below this forces a yield.
const MIN_FPS: f32 = 30.0;

/// How urgently the caller wants results, relative to everything else on the
/// machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Sleep longer; the user is doing something else.
    Low,
    Normal,
    /// Sleep as little as grading allows.
    High,
}

impl Priority {
    fn sleep_scale(self) -> f32 {
        match self {
            Priority::Low => 1.5,
            Priority::Normal => 1.0,
            Priority::High => 0.5,
        }
    }
}

/// Grade of the recent slice history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameGrade {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl FrameGrade {
    fn from_average(avg: Duration) -> Self {
        if avg <= Duration::from_millis(8) {
            FrameGrade::Excellent
        } else if avg <= Duration::from_millis(16) {
            FrameGrade::Good
        } else if avg <= Duration::from_millis(33) {
            FrameGrade::Fair
        } else {
            FrameGrade::Poor
        }
    }

    fn base_sleep(self) -> Duration {
        match self {
            FrameGrade::Excellent => Duration::ZERO,
            FrameGrade::Good => Duration::from_millis(2),
            FrameGrade::Fair => Duration::from_millis(8),
            FrameGrade::Poor => MAX_SLEEP,
        }
    }
}

/// Paces a compute loop by yielding the thread at safe points.
#[derive(Debug)]
pub struct SchedulerThrottle {
    history: VecDeque<Duration>,
    budget: Duration,
    slice_start: Instant,
    tracker: TensorTracker,
    priority: Priority,
    yields: u64,
}

impl SchedulerThrottle {
    pub fn new(tracker: TensorTracker, priority: Priority) -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_LEN),
            budget: DEFAULT_BUDGET,
            slice_start: Instant::now(),
            tracker,
            priority,
            yields: 0,
        }
    }

    /// Resets history, budget and the yield count at the start of a run.
    pub fn begin_session(&mut self) {
        self.history.clear();
        self.budget = DEFAULT_BUDGET;
        self.slice_start = Instant::now();
        self.yields = 0;
    }

    /// Yields taken since the session began.
    pub fn yields_taken(&self) -> u64 {
        self.yields
    }

    /// Called at every safe point of a compute loop. Sleeps when the pacing
    /// rules say so and returns how long was slept.
    pub fn checkpoint(&mut self) -> Duration {
        let elapsed = self.slice_start.elapsed();
        if !self.must_yield(elapsed) {
            return Duration::ZERO;
        }
        self.yields += 1;
        self.record(elapsed);
        let pause = self.sleep_duration();
        if !pause.is_zero() {
            log::trace!(
                "throttle: slice {elapsed:?}, grade {:?}, sleeping {pause:?}",
                self.grade()
            );
            std::thread::sleep(pause);
        }
        self.slice_start = Instant::now();
        pause
    }

    fn must_yield(&self, elapsed: Duration) -> bool {
        elapsed >= self.budget
            || self.grade() == FrameGrade::Poor
            || self.tracker.pressure() > PRESSURE_YIELD
            || self.effective_fps() < MIN_FPS
    }

    fn record(&mut self, slice: Duration) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(slice);
        self.adapt_budget();
    }

    fn adapt_budget(&mut self) {
        let adjusted = match self.grade() {
            FrameGrade::Excellent => self.budget + Duration::from_millis(1),
            FrameGrade::Good => self.budget,
            FrameGrade::Fair => self.budget.saturating_sub(Duration::from_millis(1)),
            FrameGrade::Poor => self.budget.saturating_sub(Duration::from_millis(2)),
        };
        self.budget = adjusted.clamp(MIN_BUDGET, MAX_BUDGET);
    }

    fn average_slice(&self) -> Duration {
        if self.history.is_empty() {
            return Duration::ZERO;
        }
        self.history.iter().sum::<Duration>() / self.history.len() as u32
    }

    /// Grade of the recent history. An empty history grades excellent.
    pub fn grade(&self) -> FrameGrade {
        FrameGrade::from_average(self.average_slice())
    }

    fn effective_fps(&self) -> f32 {
        let avg = self.average_slice();
        if avg.is_zero() {
            return f32::INFINITY;
        }
        1.0 / avg.as_secs_f32()
    }

    fn sleep_duration(&self) -> Duration {
        let mut base = self.grade().base_sleep();
        if self.tracker.pressure() > PRESSURE_YIELD {
            base = base.max(Duration::from_millis(8));
        }
        base.mul_f32(self.priority.sleep_scale()).min(MAX_SLEEP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(priority: Priority) -> SchedulerThrottle {
        SchedulerThrottle::new(TensorTracker::new(), priority)
    }

    #[test]
    fn fresh_session_grades_excellent() {
        let t = throttle(Priority::Normal);
        assert_eq!(t.grade(), FrameGrade::Excellent);
        assert_eq!(t.sleep_duration(), Duration::ZERO);
    }

    #[test]
    fn slow_slices_degrade_the_grade() {
        let mut t = throttle(Priority::Normal);
        for _ in 0..10 {
            t.record(Duration::from_millis(50));
        }
        assert_eq!(t.grade(), FrameGrade::Poor);
        assert_eq!(t.sleep_duration(), MAX_SLEEP);
    }

    #[test]
    fn budget_shrinks_under_poor_grades_and_stays_bounded() {
        let mut t = throttle(Priority::Normal);
        for _ in 0..20 {
            t.record(Duration::from_millis(50));
        }
        assert_eq!(t.budget, MIN_BUDGET);
        for _ in 0..40 {
            t.record(Duration::from_millis(1));
        }
        assert_eq!(t.budget, MAX_BUDGET);
    }

    #[test]
    fn history_is_bounded() {
        let mut t = throttle(Priority::Normal);
        for _ in 0..100 {
            t.record(Duration::from_millis(5));
        }
        assert_eq!(t.history.len(), HISTORY_LEN);
    }

    #[test]
    fn priority_scales_sleep() {
        let mut low = throttle(Priority::Low);
        let mut high = throttle(Priority::High);
        for t in [&mut low, &mut high] {
            for _ in 0..5 {
                t.record(Duration::from_millis(20)); // Fair
            }
            assert_eq!(t.grade(), FrameGrade::Fair);
        }
        assert_eq!(low.sleep_duration(), Duration::from_millis(12));
        assert_eq!(high.sleep_duration(), Duration::from_millis(4));
    }

    #[test]
    fn memory_pressure_forces_yield() {
        let tracker = TensorTracker::new();
        let _charge = tracker
            .charge((crate::tensor::MEMORY_BUDGET_BYTES as f32 * 0.8) as usize)
            .unwrap();
        let t = SchedulerThrottle::new(tracker, Priority::High);
        assert!(t.must_yield(Duration::ZERO));
        assert!(t.sleep_duration() >= Duration::from_millis(4));
    }

    #[test]
    fn checkpoint_counts_yields_per_session() {
        let tracker = TensorTracker::new();
        // Pressure above the yield line makes every checkpoint a yield.
        let _charge = tracker
            .charge((crate::tensor::MEMORY_BUDGET_BYTES as f32 * 0.8) as usize)
            .unwrap();
        let mut t = SchedulerThrottle::new(tracker, Priority::High);
        assert_eq!(t.yields_taken(), 0);
        t.checkpoint();
        t.checkpoint();
        assert_eq!(t.yields_taken(), 2);
        t.begin_session();
        assert_eq!(t.yields_taken(), 0);
    }

    #[test]
    fn session_reset_clears_history() {
        let mut t = throttle(Priority::Normal);
        for _ in 0..10 {
            t.record(Duration::from_millis(50));
        }
        t.begin_session();
        assert_eq!(t.grade(), FrameGrade::Excellent);
        assert_eq!(t.budget, DEFAULT_BUDGET);
    }
}
