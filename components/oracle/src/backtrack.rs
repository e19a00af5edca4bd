use lattice::propagate::candidates;
use lattice::{partition_cells, Board, Strategy};

use crate::{BlockSolver, RuleSolver, SolveError, SolveOutcome};

/// Completes a partition by depth-first search after the rule pass.
///
/// Forced cells come out of the rule pass marked sure; everything the
/// search itself places is a guess against the current context and stays
/// provisional. The result is deterministic for a given context, but the
/// candidate order starts at the partition index so sibling partitions
/// guess different values first.
#[derive(Debug, Default, Clone, Copy)]
pub struct BacktrackSolver;

fn search(working: &mut Board, cells: &[(usize, usize)], from: usize, rotate: usize) -> bool {
    let Some(pos) = (from..cells.len()).find(|&i| {
        let (r, c) = cells[i];
        working.get(r, c) == 0
    }) else {
        return true;
    };
    let n = working.side();
    let (r, c) = cells[pos];
    let set = candidates(working, r, c);
    for k in 0..n {
        let v = ((rotate + k) % n) as u8 + 1;
        if !set.contains(v) {
            continue;
        }
        working.set(r, c, v);
        if search(working, cells, pos + 1, rotate) {
            return true;
        }
        working.set(r, c, 0);
    }
    false
}

impl BlockSolver for BacktrackSolver {
    fn solve(
        &self,
        partition_values: &[u8],
        context: &Board,
        strategy: Strategy,
        index: u32,
    ) -> Result<SolveOutcome, SolveError> {
        let cells = partition_cells(context, strategy, index);
        if partition_values.len() != cells.len() {
            return Err(SolveError::WrongLength {
                got: partition_values.len(),
                expected: cells.len(),
            });
        }
        let mut working = context.clone();
        lattice::partition::overlay(&mut working, strategy, index, partition_values);
        let mut sure: Vec<bool> = partition_values.iter().map(|&v| v != 0).collect();
        RuleSolver::settle(&mut working, &cells, &mut sure)?;
        let rotate = index as usize % context.side();
        if !search(&mut working, &cells, 0, rotate) {
            return Err(SolveError::Infeasible);
        }
        let values = cells.iter().map(|&(r, c)| working.get(r, c)).collect();
        Ok(SolveOutcome { values, sure })
    }
}
