//! Fire-time distributions.
//!
//! Every ballot gets an absolute submission instant inside the voting
//! window `[start, start + duration]`. Three strategies are available: a
//! plain uniform spread, a bunched spread that clusters submissions into
//! random sub-intervals, and a truncated Gaussian sampled by rejection.
//! All draws come from the secure source.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use thiserror::Error;

use crate::trickle::VoteAlarm;

/// Domain half-width of the truncated Gaussian, in sigmas.
const GAUSSIAN_MAX_X: f64 = 5.0;
/// Fraction of the first half-window a bunch may start in.
const BUNCH_START_FRACTION: f64 = 0.9;

/// Errors from fire-time generation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DistributionError {
    /// The window start is not strictly before its end.
    #[error("window start {from} must be before end {to}")]
    EmptyWindow {
        /// Window start.
        from: DateTime<Utc>,
        /// Window end.
        to: DateTime<Utc>,
    },

    /// The wall-clock floor lies past the window end, leaving nothing to
    /// sample.
    #[error("milestone {milestone} is past the window end {to}")]
    MilestoneOutOfRange {
        /// Requested floor.
        milestone: DateTime<Utc>,
        /// Window end.
        to: DateTime<Utc>,
    },
}

/// Which distribution to use, resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
    /// Uniform over the window.
    Uniform,
    /// Clustered into this many sub-intervals.
    Bunched {
        /// Bunch count.
        bunches: u32,
    },
    /// Truncated Gaussian.
    Gaussian {
        /// Sigma squared, in window-axis units.
        variance: f64,
        /// Number of equal-width frames the domain is split into; also the
        /// resolution of the diagnostic chart.
        chart_len: usize,
    },
}

/// A constructed scheduler with any per-strategy state.
#[derive(Debug)]
pub enum Scheduler {
    /// Uniform over `[from, to]`.
    Uniform {
        /// Window start.
        from: DateTime<Utc>,
        /// Window end.
        to: DateTime<Utc>,
    },
    /// Bunched.
    Bunched {
        /// Window start.
        from: DateTime<Utc>,
        /// Window end.
        to: DateTime<Utc>,
        /// Bunch count.
        bunches: u32,
    },
    /// Truncated Gaussian with rejection-sampling state.
    Gaussian(Gaussian),
}

impl Scheduler {
    /// Builds a scheduler for the window.
    ///
    /// # Errors
    ///
    /// Returns [`DistributionError::EmptyWindow`] when the window is empty
    /// or inverted.
    pub fn new(
        strategy: Strategy,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Self, DistributionError> {
        if to <= from {
            return Err(DistributionError::EmptyWindow { from, to });
        }
        Ok(match strategy {
            Strategy::Uniform => Self::Uniform { from, to },
            Strategy::Bunched { bunches } => Self::Bunched { from, to, bunches },
            Strategy::Gaussian { variance, chart_len } => {
                Self::Gaussian(Gaussian::new(variance.sqrt(), 0.0, from, to, chart_len)?)
            }
        })
    }

    /// Assigns a fire time to every alarm. No assigned time lies at or
    /// before `milestone`.
    ///
    /// # Errors
    ///
    /// Returns [`DistributionError::MilestoneOutOfRange`] when the floor
    /// leaves no sampleable window.
    pub fn schedule(
        &mut self,
        alarms: &mut [VoteAlarm],
        yes_bit: &str,
        milestone: DateTime<Utc>,
    ) -> Result<(), DistributionError> {
        match self {
            Self::Uniform { from, to } => schedule_uniform(alarms, *from, *to, milestone),
            Self::Bunched { from, to, bunches } => {
                schedule_bunched(alarms, yes_bit, *bunches, *from, *to, milestone)
            }
            Self::Gaussian(gaussian) => gaussian.schedule(alarms, yes_bit, milestone),
        }
    }

    /// Per-frame yes/no acceptance counts, when the strategy keeps them.
    #[must_use]
    pub fn frame_counts(&self) -> Option<(&[u32], &[u32])> {
        match self {
            Self::Gaussian(g) => Some((&g.yes_graph, &g.no_graph)),
            _ => None,
        }
    }
}

fn window_seconds(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    milestone: DateTime<Utc>,
) -> Result<i64, DistributionError> {
    let span = (to - from).num_seconds();
    if span <= 0 {
        return Err(DistributionError::EmptyWindow { from, to });
    }
    if milestone >= to {
        return Err(DistributionError::MilestoneOutOfRange { milestone, to });
    }
    Ok(span)
}

fn schedule_uniform(
    alarms: &mut [VoteAlarm],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    milestone: DateTime<Utc>,
) -> Result<(), DistributionError> {
    let span = window_seconds(from, to, milestone)?;
    let mut rng = OsRng;
    for alarm in alarms {
        // Draws at or before the floor are discarded and retried.
        alarm.at = loop {
            let t = from + TimeDelta::seconds(rng.gen_range(0..=span));
            if t > milestone {
                break t;
            }
        };
    }
    Ok(())
}

// A bunch is a sub-interval of the window, in second offsets from its
// start.
#[derive(Debug, Clone, Copy)]
struct Bunch {
    start: i64,
    end: i64,
}

fn make_bunches(count: u32, span: i64) -> Vec<Bunch> {
    let mut rng = OsRng;
    let half = span / 2;
    let start_cap = ((half as f64) * BUNCH_START_FRACTION) as i64;
    (0..count.max(1))
        .map(|_| {
            let start = if start_cap > 0 {
                rng.gen_range(0..start_cap)
            } else {
                0
            };
            let lo = half.max(start);
            let end = if lo < span { rng.gen_range(lo..=span) } else { span };
            Bunch { start, end }
        })
        .collect()
}

/// Number of bunches assigned to the yes side. When either side has no
/// ballots, every bunch belongs to the other side; otherwise the split is
/// proportional but always leaves at least one bunch per side.
fn yes_bunch_count(yes: usize, no: usize, bunches: u32) -> u32 {
    if no == 0 {
        return bunches;
    }
    if yes == 0 {
        return 0;
    }
    let proportional = (yes as f64 / (yes + no) as f64 * f64::from(bunches)).round() as u32;
    proportional.clamp(1, bunches.saturating_sub(1).max(1))
}

fn schedule_bunched(
    alarms: &mut [VoteAlarm],
    yes_bit: &str,
    bunches: u32,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    milestone: DateTime<Utc>,
) -> Result<(), DistributionError> {
    let span = window_seconds(from, to, milestone)?;
    let bunches = bunches.max(1);
    let intervals = make_bunches(bunches, span);

    let yes_total = alarms.iter().filter(|a| a.vote.vote_bit == yes_bit).count();
    let no_total = alarms.len() - yes_total;
    let yes_bunches = yes_bunch_count(yes_total, no_total, bunches) as usize;

    let milestone_offset = (milestone - from).num_seconds();
    let mut rng = OsRng;
    let mut draw = |bunch: Bunch| {
        // Clamp the interval above the floor; a bunch that ended before the
        // floor degrades to the remainder of the window.
        let mut lo = bunch.start.max(milestone_offset + 1).max(0);
        let mut hi = bunch.end;
        if lo >= hi {
            lo = (milestone_offset + 1).max(0);
            hi = span;
        }
        let offset = if lo >= hi { hi } else { rng.gen_range(lo..=hi) };
        from + TimeDelta::seconds(offset)
    };

    // Round-robin each side across its own bunch group. With a single
    // bunch both sides share it.
    let (yes_group, no_group) = if yes_bunches == 0 || yes_bunches == intervals.len() {
        (&intervals[..], &intervals[..])
    } else {
        intervals.split_at(yes_bunches)
    };
    let (mut next_yes, mut next_no) = (0usize, 0usize);
    for alarm in alarms {
        let bunch = if alarm.vote.vote_bit == yes_bit {
            let b = yes_group[next_yes % yes_group.len()];
            next_yes += 1;
            b
        } else {
            let b = no_group[next_no % no_group.len()];
            next_no += 1;
            b
        };
        alarm.at = draw(bunch);
    }
    Ok(())
}

/// Truncated Gaussian sampler with per-frame diagnostics.
#[derive(Debug)]
pub struct Gaussian {
    sigma: f64,
    mu: f64,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    max_fx: f64,
    span: i64,
    middle: f64,
    x_frame: f64,
    time_frame: i64,
    chart_len: usize,
    /// Raw draw counts per frame.
    pub x_graph: Vec<u32>,
    /// Accepted yes votes per frame.
    pub yes_graph: Vec<u32>,
    /// Accepted no votes per frame.
    pub no_graph: Vec<u32>,
}

impl Gaussian {
    /// Builds a sampler over `[from, to]`.
    ///
    /// # Errors
    ///
    /// Returns [`DistributionError::EmptyWindow`] when `from >= to`.
    pub fn new(
        sigma: f64,
        mu: f64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        chart_len: usize,
    ) -> Result<Self, DistributionError> {
        let span = (to - from).num_seconds();
        if span <= 0 {
            return Err(DistributionError::EmptyWindow { from, to });
        }
        let chart_len = chart_len.max(1);
        let mut g = Self {
            sigma,
            mu,
            from,
            to,
            max_fx: 0.0,
            span,
            middle: span as f64 / 2.0,
            x_frame: GAUSSIAN_MAX_X * 2.0 / chart_len as f64,
            time_frame: (span / chart_len as i64).max(1),
            chart_len,
            x_graph: vec![0; chart_len],
            yes_graph: vec![0; chart_len],
            no_graph: vec![0; chart_len],
        };
        g.max_fx = g.fx(0.0);
        Ok(g)
    }

    /// The probability density at `x`.
    #[must_use]
    pub fn fx(&self, x: f64) -> f64 {
        1.0 / (self.sigma * (2.0 * std::f64::consts::PI).sqrt())
            * (-0.5 * ((x - self.mu) / self.sigma).powi(2)).exp()
    }

    // Uniform offset inside a frame's time slice, added to the frame
    // start. Clamped to the window end for the degenerate case where the
    // frame grid overshoots a tiny window.
    fn time_point(&self, frame_index: usize, rng: &mut OsRng) -> DateTime<Utc> {
        let offset = frame_index as i64 * self.time_frame + rng.gen_range(0..self.time_frame);
        self.from + TimeDelta::seconds(offset.min(self.span))
    }

    /// Assigns fire times by rejection sampling. Rejected samples and
    /// samples at or before `milestone` are silently retried; the loop ends
    /// once every alarm has a time.
    ///
    /// # Errors
    ///
    /// Returns [`DistributionError::MilestoneOutOfRange`] when `milestone`
    /// is past the window end.
    pub fn schedule(
        &mut self,
        alarms: &mut [VoteAlarm],
        yes_bit: &str,
        milestone: DateTime<Utc>,
    ) -> Result<(), DistributionError> {
        if milestone >= self.to {
            return Err(DistributionError::MilestoneOutOfRange {
                milestone,
                to: self.to,
            });
        }

        let mut rng = OsRng;
        let mut index = 0usize;
        while index < alarms.len() {
            let raw = rng.gen_range(0..self.span) as f64;
            let x = (raw - self.middle) / self.middle * GAUSSIAN_MAX_X;
            let frame_index =
                (((x + GAUSSIAN_MAX_X) / self.x_frame) as usize).min(self.chart_len - 1);

            // Whole frame earlier than the floor: nothing in it can fire.
            let frame_end =
                self.from + TimeDelta::seconds(self.time_frame * (frame_index as i64 + 1));
            if frame_end <= milestone {
                continue;
            }
            self.x_graph[frame_index] += 1;

            let y = self.fx(x);
            if y == 0.0 {
                continue;
            }
            // Accept with probability f(x)/f(0).
            if rng.gen::<f64>() >= y / self.max_fx {
                continue;
            }
            let t = self.time_point(frame_index, &mut rng);
            if t <= milestone {
                continue;
            }

            let alarm = &mut alarms[index];
            alarm.at = t;
            if alarm.vote.vote_bit == yes_bit {
                self.yes_graph[frame_index] += 1;
            } else {
                self.no_graph[frame_index] += 1;
            }
            index += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CastVote;

    fn alarms(yes: usize, no: usize) -> Vec<VoteAlarm> {
        (0..yes + no)
            .map(|i| VoteAlarm {
                vote: CastVote {
                    token: "token".to_string(),
                    ticket: format!("{i:064x}"),
                    vote_bit: if i < yes { "2" } else { "1" }.to_string(),
                    signature: String::new(),
                },
                at: Utc::now(),
                address: String::new(),
            })
            .collect()
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let from = Utc::now();
        (from, from + TimeDelta::seconds(3600))
    }

    fn assert_in_window(alarms: &[VoteAlarm], from: DateTime<Utc>, to: DateTime<Utc>, floor: DateTime<Utc>) {
        for alarm in alarms {
            assert!(alarm.at >= from, "{} before window start {from}", alarm.at);
            assert!(alarm.at <= to, "{} after window end {to}", alarm.at);
            assert!(alarm.at > floor, "{} not after floor {floor}", alarm.at);
        }
    }

    #[test]
    fn uniform_stays_in_window_and_after_milestone() {
        let (from, to) = window();
        let milestone = from + TimeDelta::seconds(1800);
        let mut batch = alarms(40, 0);
        let mut scheduler = Scheduler::new(Strategy::Uniform, from, to).unwrap();
        scheduler.schedule(&mut batch, "2", milestone).unwrap();
        assert_in_window(&batch, from, to, milestone);
    }

    #[test]
    fn bunched_stays_in_window() {
        let (from, to) = window();
        let mut batch = alarms(30, 20);
        let mut scheduler = Scheduler::new(Strategy::Bunched { bunches: 6 }, from, to).unwrap();
        scheduler.schedule(&mut batch, "2", from).unwrap();
        assert_in_window(&batch, from, to, from);
    }

    #[test]
    fn bunched_zero_side_gets_all_bunches() {
        assert_eq!(yes_bunch_count(10, 0, 6), 6);
        assert_eq!(yes_bunch_count(0, 10, 6), 0);
        // Proportional split never lands on the extremes when both sides
        // have ballots.
        assert_eq!(yes_bunch_count(1, 1000, 6), 1);
        assert_eq!(yes_bunch_count(1000, 1, 6), 5);
    }

    #[test]
    fn gaussian_rejects_inverted_window() {
        let (from, to) = window();
        assert!(matches!(
            Gaussian::new(1.0, 0.0, to, from, 60),
            Err(DistributionError::EmptyWindow { .. })
        ));
    }

    #[test]
    fn gaussian_rejects_milestone_past_end() {
        let (from, to) = window();
        let mut g = Gaussian::new(1.0, 0.0, from, to, 60).unwrap();
        let mut batch = alarms(1, 0);
        assert!(matches!(
            g.schedule(&mut batch, "2", to + TimeDelta::seconds(1)),
            Err(DistributionError::MilestoneOutOfRange { .. })
        ));
    }

    #[test]
    fn gaussian_fills_every_alarm_inside_window() {
        let (from, to) = window();
        let milestone = from + TimeDelta::seconds(60);
        let mut batch = alarms(25, 25);
        let mut scheduler = Scheduler::new(
            Strategy::Gaussian { variance: 1.0, chart_len: 60 },
            from,
            to,
        )
        .unwrap();
        scheduler.schedule(&mut batch, "2", milestone).unwrap();
        assert_in_window(&batch, from, to, milestone);

        let (yes_graph, no_graph) = scheduler.frame_counts().unwrap();
        let accepted: u32 = yes_graph.iter().chain(no_graph).sum();
        assert_eq!(accepted as usize, batch.len());
        assert_eq!(yes_graph.iter().sum::<u32>(), 25);
    }
}
