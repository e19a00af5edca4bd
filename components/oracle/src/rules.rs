use lattice::propagate::candidates;
use lattice::{partition_cells, Board, Strategy};

use crate::{BlockSolver, SolveError, SolveOutcome};

/// Fills only what the constraints force, and marks all of it sure.
///
/// Two rules run to a fixed point inside the partition: a cell whose
/// candidate set shrinks to one value takes it, and a value with exactly
/// one possible cell left in the partition lands there. Both partition
/// kinds are complete houses, so a value with no possible cell means the
/// partition cannot be finished at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleSolver;

impl RuleSolver {
    /// Runs the fixed point on `working` in place. `cells` are the
    /// partition's coordinates, `sure` the parallel mask to update.
    pub(crate) fn settle(
        working: &mut Board,
        cells: &[(usize, usize)],
        sure: &mut [bool],
    ) -> Result<(), SolveError> {
        let n = working.side();
        loop {
            let mut changed = false;
            for (i, &(r, c)) in cells.iter().enumerate() {
                if working.get(r, c) != 0 {
                    continue;
                }
                let set = candidates(working, r, c);
                if set.is_empty() {
                    return Err(SolveError::Infeasible);
                }
                if let Some(v) = set.single() {
                    working.set(r, c, v);
                    sure[i] = true;
                    changed = true;
                }
            }
            for value in 1..=n as u8 {
                if cells.iter().any(|&(r, c)| working.get(r, c) == value) {
                    continue;
                }
                let mut spots = cells.iter().enumerate().filter(|&(_, &(r, c))| {
                    working.get(r, c) == 0 && candidates(working, r, c).contains(value)
                });
                match (spots.next(), spots.next()) {
                    (None, _) => return Err(SolveError::Infeasible),
                    (Some((i, &(r, c))), None) => {
                        working.set(r, c, value);
                        sure[i] = true;
                        changed = true;
                    }
                    _ => {}
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }
}

impl BlockSolver for RuleSolver {
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
        Self::settle(&mut working, &cells, &mut sure)?;
        let values = cells.iter().map(|&(r, c)| working.get(r, c)).collect();
        Ok(SolveOutcome { values, sure })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_clues_through_as_sure() {
        let context = Board::blank(4).unwrap();
        let outcome = RuleSolver
            .solve(&[2, 0, 0, 3], &context, Strategy::Column, 1)
            .unwrap();
        assert_eq!(outcome.values[0], 2);
        assert_eq!(outcome.values[3], 3);
        assert!(outcome.sure[0]);
        assert!(outcome.sure[3]);
    }

    #[test]
    fn forced_cells_are_filled_and_sure() {
        // Column 0 holds 1, 2, 3; the last cell can only be 4.
        let context = Board::blank(4).unwrap();
        let outcome = RuleSolver
            .solve(&[1, 2, 3, 0], &context, Strategy::Column, 0)
            .unwrap();
        assert_eq!(outcome.values, vec![1, 2, 3, 4]);
        assert_eq!(outcome.sure, vec![true; 4]);
    }

    #[test]
    fn context_rows_force_placements() {
        // Rows pin down which column cell can still take a 4.
        let context = Board::from_rows(&[
            vec![0, 4, 0, 0],
            vec![0, 0, 4, 0],
            vec![0, 0, 0, 0],
            vec![0, 0, 0, 4],
        ])
        .unwrap();
        let outcome = RuleSolver
            .solve(&[0, 0, 0, 0], &context, Strategy::Column, 0)
            .unwrap();
        assert_eq!(outcome.values[2], 4);
        assert!(outcome.sure[2]);
    }

    #[test]
    fn ambiguous_cells_stay_empty_and_unsure() {
        let context = Board::blank(9).unwrap();
        let outcome = RuleSolver
            .solve(&[0; 9], &context, Strategy::Column, 4)
            .unwrap();
        assert!(outcome.values.iter().all(|&v| v == 0));
        assert!(outcome.sure.iter().all(|&s| !s));
    }

    #[test]
    fn starved_partition_is_infeasible() {
        // (1, 0) sees 2, 3, 4 in its row and the partition's own 1.
        let context = Board::from_rows(&[
            vec![0, 0, 0, 0],
            vec![0, 2, 3, 4],
            vec![0, 0, 0, 0],
            vec![0, 0, 0, 0],
        ])
        .unwrap();
        assert_eq!(
            RuleSolver.solve(&[1, 0, 0, 0], &context, Strategy::Column, 0),
            Err(SolveError::Infeasible)
        );
    }
}
