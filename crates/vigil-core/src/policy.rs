//! Escalation policy: maps elapsed inactivity onto the next action.
//!
//! The policy is a pure function of elapsed days and the set of warnings
//! already delivered this epoch. Thresholds are compared against elapsed
//! time rather than wall-clock ticks, so a daemon restart or a missed tick
//! only delays a warning until the next evaluation instead of losing it.

use crate::config::VigilConfig;
use crate::error::{VigilError, VigilResult};
use std::collections::BTreeSet;

/// Next action decided by an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No access history exists; seed the first epoch instead of escalating.
    Initialize,
    /// Deliver the warning for this day threshold.
    Warn(u64),
    /// The inactivity threshold has been reached; destruction is due.
    Destroy,
    /// Nothing to do this tick.
    Idle,
}

/// Validated escalation thresholds.
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    inactivity_days: u64,
    warning_days: Vec<u64>,
}

impl EscalationPolicy {
    /// Build a policy, rejecting unsorted, duplicated, or out-of-range
    /// warning thresholds.
    pub fn new(inactivity_days: u64, warning_days: &[u64]) -> VigilResult<Self> {
        if inactivity_days == 0 {
            return Err(VigilError::InvalidConfig(
                "inactivity_days must be at least 1".to_string(),
            ));
        }

        let mut previous: Option<u64> = None;
        for day in warning_days {
            if *day >= inactivity_days {
                return Err(VigilError::InvalidConfig(format!(
                    "warning day {day} must be less than inactivity_days {inactivity_days}"
                )));
            }
            if let Some(prev) = previous {
                if *day <= prev {
                    return Err(VigilError::InvalidConfig(format!(
                        "warning days must be strictly ascending (found {day} after {prev})"
                    )));
                }
            }
            previous = Some(*day);
        }

        Ok(Self {
            inactivity_days,
            warning_days: warning_days.to_vec(),
        })
    }

    pub fn from_config(config: &VigilConfig) -> VigilResult<Self> {
        Self::new(config.policy.inactivity_days, &config.policy.warning_days)
    }

    pub fn inactivity_days(&self) -> u64 {
        self.inactivity_days
    }

    pub fn warning_days(&self) -> &[u64] {
        &self.warning_days
    }

    pub fn first_warning_day(&self) -> Option<u64> {
        self.warning_days.first().copied()
    }

    /// Decide the next action.
    ///
    /// Precedence: no history seeds a fresh epoch; reaching the inactivity
    /// threshold destroys regardless of pending warnings; otherwise the
    /// lowest crossed-but-unsent warning fires, one per evaluation.
    pub fn evaluate(&self, elapsed_days: Option<u64>, sent: &BTreeSet<u64>) -> Action {
        let elapsed = match elapsed_days {
            Some(elapsed) => elapsed,
            None => return Action::Initialize,
        };

        if elapsed >= self.inactivity_days {
            return Action::Destroy;
        }

        for day in &self.warning_days {
            if elapsed >= *day && !sent.contains(day) {
                return Action::Warn(*day);
            }
        }

        Action::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> EscalationPolicy {
        EscalationPolicy::new(30, &[23, 27, 29]).unwrap()
    }

    fn sent(days: &[u64]) -> BTreeSet<u64> {
        days.iter().copied().collect()
    }

    #[test]
    fn rejects_unsorted_or_duplicate_warning_days() {
        assert!(EscalationPolicy::new(30, &[27, 23]).is_err());
        assert!(EscalationPolicy::new(30, &[23, 23]).is_err());
    }

    #[test]
    fn rejects_warning_days_at_or_beyond_inactivity() {
        assert!(EscalationPolicy::new(30, &[23, 30]).is_err());
        assert!(EscalationPolicy::new(30, &[31]).is_err());
        assert!(EscalationPolicy::new(0, &[]).is_err());
    }

    #[test]
    fn no_history_initializes() {
        assert_eq!(policy().evaluate(None, &sent(&[])), Action::Initialize);
    }

    #[test]
    fn fresh_epoch_is_idle() {
        assert_eq!(policy().evaluate(Some(0), &sent(&[])), Action::Idle);
    }

    #[test]
    fn destroy_at_exact_threshold() {
        assert_eq!(policy().evaluate(Some(30), &sent(&[])), Action::Destroy);
    }

    #[test]
    fn destroy_wins_regardless_of_notification_state() {
        for elapsed in [30, 31, 45, 365] {
            assert_eq!(
                policy().evaluate(Some(elapsed), &sent(&[])),
                Action::Destroy
            );
            assert_eq!(
                policy().evaluate(Some(elapsed), &sent(&[23, 27, 29])),
                Action::Destroy
            );
        }
    }

    #[test]
    fn lowest_unsent_crossed_threshold_fires() {
        assert_eq!(policy().evaluate(Some(23), &sent(&[])), Action::Warn(23));
        assert_eq!(policy().evaluate(Some(24), &sent(&[])), Action::Warn(23));
    }

    #[test]
    fn sent_level_does_not_fire_twice() {
        assert_eq!(policy().evaluate(Some(23), &sent(&[23])), Action::Idle);
        assert_eq!(policy().evaluate(Some(26), &sent(&[23])), Action::Idle);
    }

    #[test]
    fn large_gap_fires_one_level_per_tick() {
        // daemon slept from day 22 to day 28: 23 and 27 were both crossed,
        // but only the lowest fires now; 27 fires on the next evaluation
        assert_eq!(policy().evaluate(Some(28), &sent(&[])), Action::Warn(23));
        assert_eq!(policy().evaluate(Some(28), &sent(&[23])), Action::Warn(27));
        assert_eq!(
            policy().evaluate(Some(28), &sent(&[23, 27])),
            Action::Idle
        );
    }

    #[test]
    fn missed_tick_still_fires_on_next_evaluation() {
        // level-triggered: a warning missed while the daemon was down fires
        // as soon as it is re-evaluated
        assert_eq!(policy().evaluate(Some(25), &sent(&[])), Action::Warn(23));
    }

    #[test]
    fn epoch_reset_reopens_every_level() {
        let all_sent = sent(&[23, 27, 29]);
        assert_eq!(policy().evaluate(Some(29), &all_sent), Action::Idle);
        // after reset_epoch the sent-set is empty again
        assert_eq!(policy().evaluate(Some(29), &sent(&[])), Action::Warn(23));
    }

    #[test]
    fn policy_without_warnings_still_destroys() {
        let bare = EscalationPolicy::new(7, &[]).unwrap();
        assert_eq!(bare.evaluate(Some(6), &sent(&[])), Action::Idle);
        assert_eq!(bare.evaluate(Some(7), &sent(&[])), Action::Destroy);
    }
}
