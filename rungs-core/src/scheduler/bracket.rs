//! One successive-halving ladder.
//!
//! A bracket admits up to `capacity` trials and owns an ordered list of
//! promotion rungs. When a trial's progress crosses a rung's milestone its
//! reward is recorded there and ranked against every value recorded at that
//! rung so far. The top `floor(count / eta)` trials are promoted, up to the
//! cohort size of the next rung. Decisions are made online, against whatever
//! part of the cohort has reported: an early arrival can be promoted on a
//! partial comparison set, and a trial paused at a rung can still be promoted
//! later when more values arrive.
//!
//! Once admission is closed and every trial expected at a rung has reported
//! (or stopped, or errored), the rung is complete. The quota then rounds up,
//! so an underfilled rung still promotes at least one trial, and trials still
//! waiting there are culled.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::error::SchedulerError;
use crate::trial::TrialId;

const EPS: f64 = 1e-9;

/// What the bracket wants done with a trial after a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketDecision {
    Continue,
    Pause,
    Stop,
}

/// Where a trial stands inside its bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Admitted and either pending or running toward its next milestone.
    Active,
    /// Paused at `rung`, not promoted (yet).
    Waiting { rung: usize },
    /// Promoted while paused; waiting to be resumed.
    Promoted,
    /// Never promoted from a completed rung.
    Culled,
    Finished,
    Errored,
}

#[derive(Debug, Clone)]
struct Member {
    next_rung: usize,
    state: MemberState,
}

#[derive(Debug, Clone)]
struct RungRecord {
    trial: TrialId,
    value: f64,
    seq: u64,
}

/// A promotion checkpoint at a fixed milestone.
#[derive(Debug, Clone)]
pub struct Rung {
    milestone: f64,
    cap: usize,
    records: Vec<RungRecord>,
    promoted: Vec<TrialId>,
    complete: bool,
}

impl Rung {
    fn new(milestone: f64, cap: usize) -> Self {
        Self {
            milestone,
            cap,
            records: Vec::new(),
            promoted: Vec::new(),
            complete: false,
        }
    }

    pub fn milestone(&self) -> f64 {
        self.milestone
    }

    /// Maximum number of promotions out of this rung.
    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn recorded(&self) -> usize {
        self.records.len()
    }

    pub fn promoted(&self) -> &[TrialId] {
        &self.promoted
    }

    pub fn is_promoted(&self, trial: &TrialId) -> bool {
        self.promoted.contains(trial)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn value_of(&self, trial: &TrialId) -> Option<f64> {
        self.records
            .iter()
            .find(|r| r.trial == *trial)
            .map(|r| r.value)
    }

    /// Recorded trials, best first; ties go to the earlier report.
    pub fn ranking(&self) -> Vec<TrialId> {
        let mut records: Vec<&RungRecord> = self.records.iter().collect();
        records.sort_by(|a, b| b.value.total_cmp(&a.value).then(a.seq.cmp(&b.seq)));
        records.into_iter().map(|r| r.trial).collect()
    }

    /// How many of the top-ranked trials qualify for promotion right now.
    pub fn quota(&self, eta: f64) -> usize {
        let share = self.records.len() as f64 / eta;
        let quota = if self.complete {
            (share - EPS).ceil()
        } else {
            (share + EPS).floor()
        };
        quota.max(0.0) as usize
    }
}

/// Cohort size of rung `i` for a bracket admitting `capacity` trials.
pub fn cohort_size(capacity: usize, eta: f64, i: usize) -> usize {
    ((capacity as f64 / eta.powi(i as i32)) + EPS).floor().max(1.0) as usize
}

/// One successive-halving ladder.
#[derive(Debug, Clone)]
pub struct Bracket {
    index: usize,
    s: usize,
    capacity: usize,
    eta: f64,
    max_t: f64,
    rungs: Vec<Rung>,
    order: Vec<TrialId>,
    members: HashMap<TrialId, Member>,
    admission_closed: bool,
    ready: VecDeque<TrialId>,
    culled: Vec<TrialId>,
    report_seq: u64,
}

impl Bracket {
    /// Build bracket `s` of a HyperBand schedule.
    ///
    /// Promotion milestones are `floor(max_t / eta^(s - i))` for `i in 0..s`;
    /// the promotion cap of rung `i` is the cohort size of rung `i + 1`.
    pub fn new(index: usize, s: usize, capacity: usize, eta: f64, max_t: f64) -> Self {
        let capacity = capacity.max(1);
        let rungs = (0..s)
            .map(|i| {
                let milestone = (max_t / eta.powi((s - i) as i32) + EPS).floor();
                Rung::new(milestone, cohort_size(capacity, eta, i + 1))
            })
            .collect();
        Self {
            index,
            s,
            capacity,
            eta,
            max_t,
            rungs,
            order: Vec::new(),
            members: HashMap::new(),
            admission_closed: false,
            ready: VecDeque::new(),
            culled: Vec::new(),
            report_seq: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn s(&self) -> usize {
        self.s
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_t(&self) -> f64 {
        self.max_t
    }

    pub fn rungs(&self) -> &[Rung] {
        &self.rungs
    }

    pub fn milestones(&self) -> Vec<f64> {
        self.rungs.iter().map(Rung::milestone).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, trial: &TrialId) -> bool {
        self.members.contains_key(trial)
    }

    pub fn is_admitting(&self) -> bool {
        !self.admission_closed && self.order.len() < self.capacity
    }

    /// Index of the next rung the trial has to reach.
    pub fn rung_index(&self, trial: &TrialId) -> Option<usize> {
        self.members.get(trial).map(|m| m.next_rung)
    }

    pub fn state_of(&self, trial: &TrialId) -> Option<MemberState> {
        self.members.get(trial).map(|m| m.state)
    }

    /// Promoted trials waiting to be resumed, oldest promotion first.
    pub fn ready(&self) -> impl Iterator<Item = &TrialId> {
        self.ready.iter()
    }

    pub fn is_resumable(&self, trial: &TrialId) -> bool {
        self.state_of(trial) == Some(MemberState::Promoted)
    }

    /// Every admitted trial is finished, errored, or culled.
    pub fn is_finished(&self) -> bool {
        self.admission_closed
            && self.members.values().all(|m| {
                matches!(
                    m.state,
                    MemberState::Finished | MemberState::Errored | MemberState::Culled
                )
            })
    }

    /// Admit a trial; returns `false` when the bracket is full or closed.
    pub fn add_trial(&mut self, trial: TrialId) -> bool {
        if !self.is_admitting() {
            return false;
        }
        self.order.push(trial);
        self.members.insert(
            trial,
            Member {
                next_rung: 0,
                state: MemberState::Active,
            },
        );
        if self.order.len() >= self.capacity {
            self.close_admission();
        }
        true
    }

    /// No further trials will join this bracket.
    pub fn close_admission(&mut self) {
        if !self.admission_closed {
            self.admission_closed = true;
            self.update_completeness();
        }
    }

    /// Handle a result reporting progress `time` and metric `reward`.
    pub fn on_result(
        &mut self,
        trial: TrialId,
        time: f64,
        reward: f64,
    ) -> Result<BracketDecision, SchedulerError> {
        match self.state_of(&trial) {
            None => return Err(SchedulerError::UnknownTrial { id: trial }),
            Some(MemberState::Active) => {}
            Some(_) => return Err(SchedulerError::NotActive { id: trial }),
        }

        loop {
            let next = self.members[&trial].next_rung;
            if next >= self.rungs.len() || time < self.rungs[next].milestone {
                return Ok(BracketDecision::Continue);
            }

            self.report_seq += 1;
            self.rungs[next].records.push(RungRecord {
                trial,
                value: reward,
                seq: self.report_seq,
            });
            self.promote(next);
            if !self.rungs[next].is_promoted(&trial) {
                self.set_state(trial, MemberState::Waiting { rung: next });
            }
            self.update_completeness();

            match self.state_of(&trial) {
                Some(MemberState::Active) => continue,
                // Promoted by the rung completing underneath it.
                Some(MemberState::Promoted) => {
                    self.ready.retain(|id| *id != trial);
                    self.set_state(trial, MemberState::Active);
                }
                Some(MemberState::Culled) => {
                    self.culled.retain(|id| *id != trial);
                    return Ok(BracketDecision::Stop);
                }
                _ => return Ok(BracketDecision::Pause),
            }
        }
    }

    /// A promoted trial was picked to resume.
    pub fn on_resume(&mut self, trial: &TrialId) -> bool {
        if !self.is_resumable(trial) {
            return false;
        }
        self.ready.retain(|id| id != trial);
        self.set_state(*trial, MemberState::Active);
        true
    }

    /// Drop an errored trial from every comparison.
    pub fn on_error(&mut self, trial: &TrialId) {
        if !self.contains(trial) {
            return;
        }
        self.set_state(*trial, MemberState::Errored);
        self.ready.retain(|id| id != trial);
        self.culled.retain(|id| id != trial);
        for rung in &mut self.rungs {
            rung.records.retain(|r| r.trial != *trial);
            rung.promoted.retain(|id| id != trial);
        }
        for idx in 0..self.rungs.len() {
            self.promote(idx);
        }
        self.update_completeness();
    }

    /// The trial was terminated by the runner.
    pub fn on_finished(&mut self, trial: &TrialId) {
        match self.state_of(trial) {
            None | Some(MemberState::Errored) | Some(MemberState::Finished) => return,
            Some(_) => {}
        }
        self.set_state(*trial, MemberState::Finished);
        self.ready.retain(|id| id != trial);
        self.culled.retain(|id| id != trial);
        self.update_completeness();
    }

    /// Drain trials culled since the last call.
    pub fn take_culled(&mut self) -> Vec<TrialId> {
        std::mem::take(&mut self.culled)
    }

    fn set_state(&mut self, trial: TrialId, state: MemberState) {
        if let Some(member) = self.members.get_mut(&trial) {
            member.state = state;
        }
    }

    fn promote(&mut self, idx: usize) {
        let quota = self.rungs[idx].quota(self.eta);
        let ranking = self.rungs[idx].ranking();
        for trial in ranking.into_iter().take(quota) {
            if self.rungs[idx].promoted.len() >= self.rungs[idx].cap {
                break;
            }
            if self.rungs[idx].is_promoted(&trial) {
                continue;
            }
            let Some(member) = self.members.get_mut(&trial) else {
                continue;
            };
            match member.state {
                MemberState::Active => {}
                MemberState::Waiting { rung } if rung == idx => {
                    member.state = MemberState::Promoted;
                    self.ready.push_back(trial);
                }
                _ => continue,
            }
            member.next_rung = idx + 1;
            self.rungs[idx].promoted.push(trial);
        }
    }

    fn update_completeness(&mut self) {
        if !self.admission_closed {
            return;
        }
        for idx in 0..self.rungs.len() {
            if self.rungs[idx].complete {
                continue;
            }
            if idx > 0 && !self.rungs[idx - 1].complete {
                return;
            }
            let expected = if idx == 0 {
                &self.order
            } else {
                &self.rungs[idx - 1].promoted
            };
            let settled = expected.iter().all(|trial| {
                self.rungs[idx].value_of(trial).is_some()
                    || matches!(
                        self.members.get(trial).map(|m| m.state),
                        Some(MemberState::Finished | MemberState::Errored | MemberState::Culled)
                    )
            });
            if !settled {
                return;
            }

            self.rungs[idx].complete = true;
            self.promote(idx);
            let waiting: Vec<TrialId> = self
                .order
                .iter()
                .filter(|trial| {
                    self.members.get(trial).map(|m| m.state)
                        == Some(MemberState::Waiting { rung: idx })
                })
                .copied()
                .collect();
            for trial in waiting {
                self.set_state(trial, MemberState::Culled);
                self.culled.push(trial);
            }
        }
    }
}

impl fmt::Display for Bracket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self
            .members
            .values()
            .filter(|m| {
                matches!(
                    m.state,
                    MemberState::Active | MemberState::Waiting { .. } | MemberState::Promoted
                )
            })
            .count();
        writeln!(
            f,
            "Bracket {} (s={}, n0={}): {} trials, {} live{}",
            self.index,
            self.s,
            self.capacity,
            self.order.len(),
            live,
            if self.admission_closed { "" } else { ", admitting" }
        )?;
        for rung in &self.rungs {
            writeln!(
                f,
                "  rung t={}: {} recorded, {}/{} promoted{}",
                rung.milestone,
                rung.recorded(),
                rung.promoted.len(),
                rung.cap,
                if rung.complete { " [complete]" } else { "" }
            )?;
        }
        write!(f, "  final t={}", self.max_t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(n: usize) -> Vec<TrialId> {
        (0..n).map(|_| TrialId::new_v4()).collect()
    }

    /// Nine trials, one promotion rung at t=33, final budget 100.
    fn nine_trial_bracket() -> (Bracket, Vec<TrialId>) {
        let mut bracket = Bracket::new(0, 1, 9, 3.0, 100.0);
        let trials = ids(9);
        for trial in &trials {
            assert!(bracket.add_trial(*trial));
        }
        (bracket, trials)
    }

    #[test]
    fn test_bracket_shape() {
        let bracket = Bracket::new(0, 4, 81, 3.0, 81.0);
        assert_eq!(bracket.milestones(), vec![1.0, 3.0, 9.0, 27.0]);
        let caps: Vec<usize> = bracket.rungs().iter().map(Rung::cap).collect();
        assert_eq!(caps, vec![27, 9, 3, 1]);

        let single = Bracket::new(1, 1, 9, 3.0, 100.0);
        assert_eq!(single.milestones(), vec![33.0]);
        assert_eq!(single.rungs()[0].cap(), 3);

        let no_rungs = Bracket::new(2, 0, 5, 3.0, 100.0);
        assert!(no_rungs.rungs().is_empty());
    }

    #[test]
    fn test_admission_closes_when_full() {
        let mut bracket = Bracket::new(0, 1, 2, 3.0, 9.0);
        assert!(bracket.add_trial(TrialId::new_v4()));
        assert!(bracket.is_admitting());
        assert!(bracket.add_trial(TrialId::new_v4()));
        assert!(!bracket.is_admitting());
        assert!(!bracket.add_trial(TrialId::new_v4()));
    }

    #[test]
    fn test_continue_before_milestone() {
        let (mut bracket, trials) = nine_trial_bracket();
        for t in 1..33 {
            assert_eq!(
                bracket.on_result(trials[0], t as f64, 1.0).unwrap(),
                BracketDecision::Continue
            );
        }
        assert_eq!(bracket.rungs()[0].recorded(), 0);
    }

    #[test]
    fn test_top_third_promoted_when_best_arrive_first() {
        let (mut bracket, trials) = nine_trial_bracket();
        // trials[k] reaches the rung with reward k; arrivals run best-first.
        let mut decisions = Vec::new();
        for k in (0..9).rev() {
            decisions.push(bracket.on_result(trials[k], 33.0, k as f64).unwrap());
        }
        assert!(decisions.iter().all(|d| *d != BracketDecision::Continue));

        let promoted: Vec<TrialId> = bracket.rungs()[0].promoted().to_vec();
        assert_eq!(promoted, vec![trials[8], trials[7], trials[6]]);
        let ready: Vec<TrialId> = bracket.ready().copied().collect();
        assert_eq!(ready, promoted);
        assert!(bracket.rungs()[0].is_complete());

        // The last arrival was culled in place; the rest are handed back.
        assert_eq!(decisions.last(), Some(&BracketDecision::Stop));
        let culled = bracket.take_culled();
        assert_eq!(culled.len(), 5);
        for k in 0..6 {
            assert_eq!(bracket.rung_index(&trials[k]), Some(0));
            assert!(!bracket.is_resumable(&trials[k]));
        }

        for k in 6..9 {
            assert!(bracket.on_resume(&trials[k]));
            assert_eq!(bracket.rung_index(&trials[k]), Some(1));
            assert_eq!(
                bracket.on_result(trials[k], 100.0, 10.0).unwrap(),
                BracketDecision::Continue
            );
        }
    }

    #[test]
    fn test_partial_cohort_promotes_early_arrivals() {
        let (mut bracket, trials) = nine_trial_bracket();
        // Worst-first arrivals: the third report is the best seen so far and
        // goes straight through.
        let mut decisions = Vec::new();
        for k in 0..9 {
            decisions.push(bracket.on_result(trials[k], 33.0, k as f64).unwrap());
        }
        assert_eq!(decisions[0], BracketDecision::Pause);
        assert_eq!(decisions[1], BracketDecision::Pause);
        assert_eq!(decisions[2], BracketDecision::Continue);
        assert_eq!(decisions[5], BracketDecision::Continue);
        let promoted = bracket.rungs()[0].promoted().to_vec();
        assert_eq!(promoted, vec![trials[2], trials[5], trials[4]]);
        // Cap reached: later, better trials wait and are culled.
        assert!(bracket.take_culled().contains(&trials[6]));
    }

    #[test]
    fn test_decision_depends_on_values_not_arrival_order() {
        let values = [5.0, 1.0, 4.0, 2.0, 3.0];
        let orders: [[usize; 5]; 3] = [[0, 1, 2, 3, 4], [4, 3, 2, 1, 0], [2, 0, 4, 1, 3]];
        for candidate in [4.5, 3.5, 0.5] {
            let mut outcomes = Vec::new();
            for order in &orders {
                let (mut bracket, trials) = nine_trial_bracket();
                for &i in order {
                    bracket.on_result(trials[i], 33.0, values[i]).unwrap();
                }
                outcomes.push(bracket.on_result(trials[5], 33.0, candidate).unwrap());
            }
            assert!(
                outcomes.windows(2).all(|w| w[0] == w[1]),
                "candidate {candidate}: {outcomes:?}"
            );
        }
    }

    #[test]
    fn test_ties_go_to_earlier_report() {
        let (mut bracket, trials) = nine_trial_bracket();
        for trial in &trials[..3] {
            bracket.on_result(*trial, 33.0, 1.0).unwrap();
        }
        assert_eq!(bracket.rungs()[0].promoted(), &[trials[0]]);
    }

    #[test]
    fn test_multiple_milestones_in_one_report() {
        let mut bracket = Bracket::new(0, 2, 1, 3.0, 9.0);
        let trial = TrialId::new_v4();
        bracket.add_trial(trial);
        // Single member: each rung completes on arrival and promotes it.
        assert_eq!(
            bracket.on_result(trial, 5.0, 1.0).unwrap(),
            BracketDecision::Continue
        );
        assert_eq!(bracket.rung_index(&trial), Some(2));
    }

    #[test]
    fn test_underfilled_bracket_still_promotes_after_seal() {
        let mut bracket = Bracket::new(0, 1, 9, 3.0, 100.0);
        let trials = ids(2);
        for trial in &trials {
            bracket.add_trial(*trial);
        }
        assert_eq!(
            bracket.on_result(trials[0], 33.0, 1.0).unwrap(),
            BracketDecision::Pause
        );
        bracket.close_admission();
        assert_eq!(
            bracket.on_result(trials[1], 33.0, 2.0).unwrap(),
            BracketDecision::Continue
        );
        assert_eq!(bracket.take_culled(), vec![trials[0]]);
    }

    #[test]
    fn test_errored_trial_removed_from_comparisons() {
        let (mut bracket, trials) = nine_trial_bracket();
        bracket.on_result(trials[0], 33.0, 100.0).unwrap();
        bracket.on_result(trials[1], 33.0, 1.0).unwrap();
        bracket.on_error(&trials[0]);
        assert_eq!(bracket.rungs()[0].recorded(), 1);
        assert!(bracket.rungs()[0].value_of(&trials[0]).is_none());
        assert_eq!(bracket.state_of(&trials[0]), Some(MemberState::Errored));

        // Third report: quota 2/3 floors to 0 without the errored trial.
        assert_eq!(
            bracket.on_result(trials[2], 33.0, 2.0).unwrap(),
            BracketDecision::Pause
        );
        assert!(bracket.rungs()[0].promoted().is_empty());
    }

    #[test]
    fn test_bracket_finishes_when_all_members_settle() {
        let mut bracket = Bracket::new(0, 0, 2, 3.0, 10.0);
        let trials = ids(2);
        for trial in &trials {
            bracket.add_trial(*trial);
        }
        assert!(!bracket.is_finished());
        bracket.on_finished(&trials[0]);
        bracket.on_error(&trials[1]);
        assert!(bracket.is_finished());
    }

    #[test]
    fn test_result_for_paused_trial_rejected() {
        let (mut bracket, trials) = nine_trial_bracket();
        bracket.on_result(trials[0], 33.0, 1.0).unwrap();
        assert!(matches!(
            bracket.on_result(trials[0], 34.0, 1.0),
            Err(SchedulerError::NotActive { .. })
        ));
        assert!(matches!(
            bracket.on_result(TrialId::new_v4(), 1.0, 1.0),
            Err(SchedulerError::UnknownTrial { .. })
        ));
    }

    #[test]
    fn test_display_lists_rungs() {
        let (bracket, _) = nine_trial_bracket();
        let text = bracket.to_string();
        assert!(text.contains("Bracket 0 (s=1, n0=9)"));
        assert!(text.contains("rung t=33"));
    }
}
