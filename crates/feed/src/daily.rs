use chrono::NaiveDate;
use fxsim_core::Bar;

/// Default minimum number of completed days before daily-derived features
/// are considered usable.
pub const DEFAULT_MIN_DAILY_DAYS: usize = 15;

/// Derived daily aggregate for one symbol: the last bar of each *completed*
/// UTC calendar day. The day currently in progress is never exposed.
///
/// Too-short history is a capability question for the caller, not an
/// error: a strategy checks `sufficient()` and skips daily-dependent
/// features instead of tripping over a missing value downstream.
#[derive(Debug, Clone, Default)]
pub struct DailyHistory {
    completed: Vec<Bar>,
    in_progress: Option<(NaiveDate, Bar)>,
}

impl DailyHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one intraday bar through the aggregator. Bars must arrive in
    /// timestamp order (the synchronizer guarantees this).
    pub fn observe(&mut self, bar: &Bar) {
        let date = bar.timestamp.date_naive();
        match &mut self.in_progress {
            Some((current, last)) if *current == date => {
                *last = bar.clone();
            }
            Some((current, last)) if *current < date => {
                self.completed.push(last.clone());
                self.in_progress = Some((date, bar.clone()));
            }
            Some(_) => {
                // Out-of-order date; the synchronizer's monotonicity guard
                // makes this unreachable, so ignore rather than corrupt.
            }
            None => {
                self.in_progress = Some((date, bar.clone()));
            }
        }
    }

    pub fn completed_days(&self) -> usize {
        self.completed.len()
    }

    pub fn sufficient(&self, min_days: usize) -> bool {
        self.completed.len() >= min_days
    }

    /// Closing bars of completed days, oldest first.
    pub fn bars(&self) -> &[Bar] {
        &self.completed
    }

    pub fn last_completed(&self) -> Option<&Bar> {
        self.completed.last()
    }
}
