use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use lattice::{partition, partition_cells, propagate, Board, LatticeError, Strategy};
use uuid::Uuid;

use crate::types::SubJob;

/// Requeue rounds that add no new sure cell before a job is given up on.
pub const BARREN_ROUND_LIMIT: u32 = 10;

pub fn stall_threshold(side: usize) -> Duration {
    Duration::from_secs((120 * side as u64 / 9).max(60))
}

/// A worker's completion of one partition, already parsed off the wire.
#[derive(Debug, Clone)]
pub struct PartitionResult {
    pub partition_index: u32,
    pub values: Vec<u8>,
    pub sure: Vec<bool>,
    pub iteration: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Accepted {
    Aggregated,
    Stale,
    Duplicate,
    Invalid,
}

#[derive(Debug)]
pub enum Verdict {
    Solved(Board),
    Requeue(Vec<SubJob>),
    Abandoned,
    Pending,
}

/// Everything the master tracks for one job. Lives behind its own mutex
/// in the registry; every method here assumes the lock is held.
#[derive(Debug)]
pub struct JobState {
    pub id: Uuid,
    pub strategy: Strategy,
    pub initial: Board,
    pub current: Board,
    pub iteration: u32,
    pub expected: Vec<u32>,
    pub completed: HashMap<u32, PartitionResult>,
    pub started_at: Instant,
    pub last_progress_at: Instant,
    baseline_filled: usize,
    pub barren_rounds: u32,
    combine_conflict: bool,
}

impl JobState {
    pub fn new(id: Uuid, initial: Board, strategy: Strategy) -> Result<Self, LatticeError> {
        let mut current = initial.clone();
        propagate(&mut current)?;
        let baseline_filled = current.filled_count();
        Ok(Self {
            id,
            strategy,
            initial,
            current,
            iteration: 1,
            expected: Vec::new(),
            completed: HashMap::new(),
            started_at: Instant::now(),
            last_progress_at: Instant::now(),
            baseline_filled,
            barren_rounds: 0,
            combine_conflict: false,
        })
    }

    /// Cuts the first round of sub-jobs from the propagated blueprint.
    pub fn first_round(&mut self) -> Vec<SubJob> {
        self.make_round(None, false)
    }

    /// The iteration gate runs before anything else: a result from any
    /// other round must not touch state.
    pub fn accept(&mut self, result: PartitionResult) -> Accepted {
        if result.iteration != self.iteration {
            return Accepted::Stale;
        }
        let already = self
            .completed
            .get(&result.partition_index)
            .map_or(false, |r| r.iteration == self.iteration);
        if already {
            return Accepted::Duplicate;
        }
        if !self.result_is_plausible(&result) {
            return Accepted::Invalid;
        }
        self.last_progress_at = Instant::now();
        self.completed.insert(result.partition_index, result);
        self.recombine();
        Accepted::Aggregated
    }

    fn result_is_plausible(&self, result: &PartitionResult) -> bool {
        let n = self.initial.side();
        if result.partition_index as usize >= n {
            return false;
        }
        let cells = partition_cells(&self.initial, self.strategy, result.partition_index);
        result.values.len() == cells.len()
            && result.sure.len() == cells.len()
            && result.values.iter().all(|&v| v as usize <= n)
            && cells.iter().enumerate().all(|(i, &(r, c))| {
                let clue = self.initial.get(r, c);
                clue == 0 || result.values[i] == clue
            })
    }

    /// Rebuilds the blueprint: original clues, plus every sure cell of
    /// the retained completions, then propagation. Sure overlays commute,
    /// so arrival order never matters.
    fn recombine(&mut self) {
        let mut next = self.initial.clone();
        for result in self.completed.values() {
            let cells = partition_cells(&next, self.strategy, result.partition_index);
            for (i, &(r, c)) in cells.iter().enumerate() {
                if result.sure[i] && result.values[i] != 0 && next.get(r, c) == 0 {
                    next.set(r, c, result.values[i]);
                }
            }
        }
        if !next.is_well_formed() {
            self.combine_conflict = true;
            return;
        }
        match propagate(&mut next) {
            Ok(_) => {
                self.combine_conflict = false;
                if next.filled_count() > self.current.filled_count() {
                    self.last_progress_at = Instant::now();
                }
                self.current = next;
            }
            Err(_) => self.combine_conflict = true,
        }
    }

    fn round_complete(&self) -> bool {
        self.expected
            .iter()
            .all(|idx| self.completed.get(idx).map_or(false, |r| r.iteration == self.iteration))
    }

    pub fn outstanding(&self) -> usize {
        self.expected
            .iter()
            .filter(|idx| {
                self.completed
                    .get(idx)
                    .map_or(true, |r| r.iteration != self.iteration)
            })
            .count()
    }

    /// Decides what happens next: solved, keep waiting, requeue, or give
    /// up. Called after every aggregation and from the periodic sweep.
    pub fn completion_check(&mut self) -> Verdict {
        if self.current.is_solved() {
            return Verdict::Solved(self.current.clone());
        }
        if !self.round_complete() {
            return Verdict::Pending;
        }
        let tentative = self.compose_tentative();
        if tentative.is_solved() {
            return Verdict::Solved(tentative);
        }
        let conflicts = self.conflicting_partitions(&tentative);
        let sub_jobs = if conflicts.is_empty() {
            self.full_requeue()
        } else {
            self.selective_requeue(&conflicts)
        };
        if self.barren_rounds >= BARREN_ROUND_LIMIT {
            return Verdict::Abandoned;
        }
        Verdict::Requeue(sub_jobs)
    }

    /// The blueprint plus every provisional value of the round's
    /// completions. Sure cells are already in `current` and win.
    fn compose_tentative(&self) -> Board {
        let mut tentative = self.current.clone();
        for result in self.completed.values() {
            let cells = partition_cells(&tentative, self.strategy, result.partition_index);
            for (i, &(r, c)) in cells.iter().enumerate() {
                if tentative.get(r, c) == 0 && result.values[i] != 0 {
                    tentative.set(r, c, result.values[i]);
                }
            }
        }
        tentative
    }

    /// Maps every duplicated value in a row or column to the partitions
    /// that supplied the offending cells.
    pub fn conflicting_partitions(&self, board: &Board) -> HashSet<u32> {
        let n = board.side();
        let mut conflicts = HashSet::new();
        let mut mark = |row: usize, col: usize| {
            let index = match self.strategy {
                Strategy::Column => col as u32,
                Strategy::Block => board.block_index(row, col) as u32,
            };
            conflicts.insert(index);
        };
        for row in 0..n {
            let mut first_col = vec![usize::MAX; n + 1];
            for col in 0..n {
                let v = board.get(row, col) as usize;
                if v == 0 {
                    continue;
                }
                if first_col[v] != usize::MAX {
                    mark(row, first_col[v]);
                    mark(row, col);
                } else {
                    first_col[v] = col;
                }
            }
        }
        for col in 0..n {
            let mut first_row = vec![usize::MAX; n + 1];
            for row in 0..n {
                let v = board.get(row, col) as usize;
                if v == 0 {
                    continue;
                }
                if first_row[v] != usize::MAX {
                    mark(first_row[v], col);
                    mark(row, col);
                } else {
                    first_row[v] = row;
                }
            }
        }
        conflicts
    }

    /// Opens a fresh iteration for the conflicting partitions (plus any
    /// still-outstanding ones) while keeping every other completion.
    pub fn selective_requeue(&mut self, conflicts: &HashSet<u32>) -> Vec<SubJob> {
        let mut targets = conflicts.clone();
        for &idx in &self.expected {
            let done = self
                .completed
                .get(&idx)
                .map_or(false, |r| r.iteration == self.iteration);
            if !done {
                targets.insert(idx);
            }
        }
        self.iteration += 1;
        self.completed.retain(|idx, _| !conflicts.contains(idx));
        self.recombine();
        if self.combine_conflict {
            // The retained results still disagree; start the round clean.
            self.completed.clear();
            self.recombine();
            self.track_round();
            return self.make_round(None, true);
        }
        self.track_round();
        self.make_round(Some(&targets), true)
    }

    /// Drops every completion and rebuilds the round from the clues.
    pub fn full_requeue(&mut self) -> Vec<SubJob> {
        self.iteration += 1;
        self.completed.clear();
        self.recombine();
        self.track_round();
        self.make_round(None, true)
    }

    fn track_round(&mut self) {
        let filled = self.current.filled_count();
        if filled > self.baseline_filled {
            self.barren_rounds = 0;
        } else {
            self.barren_rounds += 1;
        }
        self.baseline_filled = filled;
    }

    fn make_round(&mut self, only: Option<&HashSet<u32>>, is_requeue: bool) -> Vec<SubJob> {
        let mut seq = 0u32;
        let sub_jobs: Vec<SubJob> = partition(&self.current, self.strategy)
            .into_iter()
            .filter(|(idx, _)| only.map_or(true, |set| set.contains(idx)))
            .map(|(idx, values)| {
                seq += 1;
                SubJob {
                    id: format!("{}.{}", self.id, seq),
                    job_id: self.id,
                    partition_index: idx,
                    values,
                    iteration: self.iteration,
                    is_requeue,
                    context: self.current.clone(),
                }
            })
            .collect();
        self.expected = sub_jobs.iter().map(|s| s.partition_index).collect();
        sub_jobs
    }

    pub fn stalled(&self, queue_empty: bool) -> bool {
        self.outstanding() > 0
            && queue_empty
            && self.last_progress_at.elapsed() > stall_threshold(self.current.side())
    }

    pub fn progress(&self) -> u8 {
        let n = self.current.side();
        (self.current.filled_count() * 100 / (n * n)) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_job() -> JobState {
        let board = Board::blank(4).unwrap();
        JobState::new(Uuid::new_v4(), board, Strategy::Column).unwrap()
    }

    fn column_result(job: &JobState, index: u32, values: [u8; 4], sure: [bool; 4]) -> PartitionResult {
        PartitionResult {
            partition_index: index,
            values: values.to_vec(),
            sure: sure.to_vec(),
            iteration: job.iteration,
        }
    }

    // Columns of a solved 4x4 grid.
    const COLS: [[u8; 4]; 4] = [
        [1, 3, 2, 4],
        [2, 4, 1, 3],
        [3, 1, 4, 2],
        [4, 2, 3, 1],
    ];

    #[test]
    fn first_round_covers_open_partitions() {
        let mut job = blank_job();
        let subs = job.first_round();
        assert_eq!(subs.len(), 4);
        assert_eq!(subs[0].id, format!("{}.1", job.id));
        assert_eq!(subs[3].id, format!("{}.4", job.id));
        assert!(subs.iter().all(|s| !s.is_requeue && s.iteration == 1));
        assert_eq!(job.expected, vec![0, 1, 2, 3]);
    }

    #[test]
    fn clues_survive_every_aggregation() {
        let initial = Board::from_rows(&[
            vec![1, 0, 0, 0],
            vec![0, 0, 0, 0],
            vec![0, 0, 1, 0],
            vec![0, 0, 0, 0],
        ])
        .unwrap();
        let mut job = JobState::new(Uuid::new_v4(), initial, Strategy::Column).unwrap();
        job.first_round();
        let res = column_result(&job, 0, [1, 3, 2, 4], [true; 4]);
        assert_eq!(job.accept(res), Accepted::Aggregated);
        assert_eq!(job.current.get(0, 0), 1);
        assert_eq!(job.current.get(2, 2), 1);
    }

    #[test]
    fn clue_mismatch_is_rejected() {
        let initial = Board::from_rows(&[
            vec![2, 0, 0, 0],
            vec![0, 0, 0, 0],
            vec![0, 0, 0, 0],
            vec![0, 0, 0, 0],
        ])
        .unwrap();
        let mut job = JobState::new(Uuid::new_v4(), initial, Strategy::Column).unwrap();
        job.first_round();
        let res = column_result(&job, 0, [1, 3, 2, 4], [true; 4]);
        assert_eq!(job.accept(res), Accepted::Invalid);
        assert!(job.completed.is_empty());
    }

    #[test]
    fn stale_iterations_never_touch_state() {
        let mut job = blank_job();
        job.first_round();
        let mut res = column_result(&job, 0, COLS[0], [true; 4]);
        res.iteration = 7;
        let before = job.current.clone();
        assert_eq!(job.accept(res), Accepted::Stale);
        assert!(job.completed.is_empty());
        assert_eq!(job.current, before);
    }

    #[test]
    fn duplicate_results_leave_state_identical() {
        let mut job = blank_job();
        job.first_round();
        assert_eq!(
            job.accept(column_result(&job, 0, COLS[0], [true; 4])),
            Accepted::Aggregated
        );
        let snapshot = job.current.clone();
        assert_eq!(
            job.accept(column_result(&job, 0, COLS[0], [true; 4])),
            Accepted::Duplicate
        );
        assert_eq!(job.current, snapshot);
        assert_eq!(job.completed.len(), 1);
    }

    #[test]
    fn sure_results_drive_the_job_to_solved() {
        let mut job = blank_job();
        job.first_round();
        for index in 0..4u32 {
            let res = column_result(&job, index, COLS[index as usize], [true; 4]);
            assert_eq!(job.accept(res), Accepted::Aggregated);
        }
        match job.completion_check() {
            Verdict::Solved(board) => assert!(board.is_solved()),
            other => panic!("expected solved, got {other:?}"),
        }
    }

    #[test]
    fn provisional_results_solve_through_the_tentative_board() {
        let mut job = blank_job();
        job.first_round();
        for index in 0..4u32 {
            let res = column_result(&job, index, COLS[index as usize], [false; 4]);
            assert_eq!(job.accept(res), Accepted::Aggregated);
        }
        // Nothing sure ever entered the blueprint.
        assert_eq!(job.current.filled_count(), 0);
        match job.completion_check() {
            Verdict::Solved(board) => assert!(board.is_solved()),
            other => panic!("expected solved, got {other:?}"),
        }
    }

    #[test]
    fn row_duplicates_trigger_a_selective_requeue() {
        let mut job = blank_job();
        job.first_round();
        // Column 1 collides with column 0 on two rows; 2 and 3 are clean.
        let bad = [
            [1, 3, 2, 4],
            [1, 4, 2, 3],
            [3, 1, 4, 2],
            [4, 2, 3, 1],
        ];
        for index in 0..4u32 {
            job.accept(column_result(&job, index, bad[index as usize], [false; 4]));
        }
        let verdict = job.completion_check();
        let subs = match verdict {
            Verdict::Requeue(subs) => subs,
            other => panic!("expected requeue, got {other:?}"),
        };
        assert_eq!(job.iteration, 2);
        let mut indices: Vec<u32> = subs.iter().map(|s| s.partition_index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1]);
        assert!(subs.iter().all(|s| s.is_requeue && s.iteration == 2));
        // The clean completions were kept, the colliding ones dropped.
        assert!(job.completed.contains_key(&2));
        assert!(job.completed.contains_key(&3));
        assert!(!job.completed.contains_key(&0));
        assert!(!job.completed.contains_key(&1));
        assert_eq!(job.expected, vec![0, 1]);
    }

    #[test]
    fn empty_rounds_fall_back_to_a_full_requeue() {
        let mut job = blank_job();
        job.first_round();
        for index in 0..4u32 {
            job.accept(column_result(&job, index, [0; 4], [false; 4]));
        }
        let verdict = job.completion_check();
        match verdict {
            Verdict::Requeue(subs) => {
                assert_eq!(subs.len(), 4);
                assert!(subs.iter().all(|s| s.iteration == 2));
            }
            other => panic!("expected requeue, got {other:?}"),
        }
        assert_eq!(job.iteration, 2);
        assert!(job.completed.is_empty());
        assert_eq!(job.barren_rounds, 1);
    }

    #[test]
    fn barren_rounds_abandon_the_job() {
        let mut job = blank_job();
        job.first_round();
        for round in 0..BARREN_ROUND_LIMIT {
            for index in 0..4u32 {
                job.accept(column_result(&job, index, [0; 4], [false; 4]));
            }
            match job.completion_check() {
                Verdict::Requeue(_) if round + 1 < BARREN_ROUND_LIMIT => {}
                Verdict::Abandoned if round + 1 == BARREN_ROUND_LIMIT => return,
                other => panic!("round {round}: unexpected verdict {other:?}"),
            }
        }
        panic!("job was never abandoned");
    }

    #[test]
    fn stall_needs_outstanding_work_and_an_empty_queue() {
        let mut job = blank_job();
        job.first_round();
        assert!(!job.stalled(true)); // fresh progress timestamp
        job.last_progress_at = Instant::now() - stall_threshold(4) - Duration::from_secs(1);
        assert!(job.stalled(true));
        assert!(!job.stalled(false));
        for index in 0..4u32 {
            job.accept(column_result(&job, index, COLS[index as usize], [true; 4]));
        }
        job.last_progress_at = Instant::now() - stall_threshold(4) - Duration::from_secs(1);
        assert!(!job.stalled(true)); // nothing outstanding
    }
}
