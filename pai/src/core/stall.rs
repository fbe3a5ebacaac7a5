//! Early-finish circuit breaker for model-induced stalls.

use std::collections::VecDeque;

use crate::core::action::Action;

pub const DEFAULT_EARLY_FINISH_THRESHOLD: usize = 3;

/// Counts consecutive no-op steps.
///
/// A step is a no-op when the plan produced no valid action, or when the
/// executed action is structurally equal to one of the previous `threshold`
/// executed actions.
#[derive(Debug, Clone)]
pub struct StallDetector {
    threshold: usize,
    recent: VecDeque<Action>,
    consecutive: usize,
}

impl StallDetector {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            recent: VecDeque::new(),
            consecutive: 0,
        }
    }

    /// Record one step. Returns `true` once the breaker trips.
    pub fn observe(&mut self, executed: Option<&Action>) -> bool {
        let no_op = match executed {
            None => true,
            Some(action) => self.recent.contains(action),
        };

        if let Some(action) = executed {
            self.recent.push_back(action.clone());
            while self.recent.len() > self.threshold {
                self.recent.pop_front();
            }
        }

        if no_op {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        self.tripped()
    }

    pub fn tripped(&self) -> bool {
        self.consecutive >= self.threshold
    }

    pub fn consecutive(&self) -> usize {
        self.consecutive
    }

    /// Forget everything; used when a new user request starts.
    pub fn reset(&mut self) {
        self.recent.clear();
        self.consecutive = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: &str) -> Action {
        Action::ReadFile {
            path: path.to_string(),
        }
    }

    #[test]
    fn repeated_action_trips_after_threshold_duplicates() {
        let mut detector = StallDetector::new(3);
        assert!(!detector.observe(Some(&read("a.py"))));
        assert!(!detector.observe(Some(&read("a.py"))));
        assert!(!detector.observe(Some(&read("a.py"))));
        assert!(detector.observe(Some(&read("a.py"))));
    }

    #[test]
    fn progress_resets_the_counter() {
        let mut detector = StallDetector::new(2);
        detector.observe(Some(&read("a.py")));
        detector.observe(Some(&read("a.py")));
        assert_eq!(detector.consecutive(), 1);
        detector.observe(Some(&read("b.py")));
        assert_eq!(detector.consecutive(), 0);
        assert!(!detector.tripped());
    }

    #[test]
    fn empty_plans_count_as_no_ops() {
        let mut detector = StallDetector::new(3);
        assert!(!detector.observe(None));
        assert!(!detector.observe(None));
        assert!(detector.observe(None));
    }

    #[test]
    fn duplicates_are_judged_against_a_bounded_window() {
        let mut detector = StallDetector::new(2);
        detector.observe(Some(&read("a")));
        detector.observe(Some(&read("b")));
        detector.observe(Some(&read("c")));
        // "a" fell out of the two-action window.
        detector.observe(Some(&read("a")));
        assert_eq!(detector.consecutive(), 0);
    }

    #[test]
    fn reset_clears_state() {
        let mut detector = StallDetector::new(1);
        assert!(detector.observe(None));
        detector.reset();
        assert!(!detector.tripped());
    }
}
