use lattice::{Board, Strategy};
use thiserror::Error;

pub mod backtrack;
pub mod rules;

pub use backtrack::BacktrackSolver;
pub use rules::RuleSolver;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SolveError {
    #[error("partition admits no completion under its context")]
    Infeasible,
    #[error("partition carries {got} values, expected {expected}")]
    WrongLength { got: usize, expected: usize },
}

/// What a solver hands back: a value vector parallel to the partition,
/// and a mask marking the cells it is certain about. Pre-filled cells are
/// always copied through as sure; a guessed cell is never sure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveOutcome {
    pub values: Vec<u8>,
    pub sure: Vec<bool>,
}

/// A pluggable partition solver. The caller never learns how values were
/// derived; only the sure mask decides what it may rely on.
pub trait BlockSolver: Send + Sync {
    fn solve(
        &self,
        partition_values: &[u8],
        context: &Board,
        strategy: Strategy,
        index: u32,
    ) -> Result<SolveOutcome, SolveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_vectors_stay_parallel() {
        let context = Board::blank(4).unwrap();
        let outcome = RuleSolver
            .solve(&[0, 0, 0, 0], &context, Strategy::Column, 0)
            .unwrap();
        assert_eq!(outcome.values.len(), 4);
        assert_eq!(outcome.sure.len(), 4);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let context = Board::blank(4).unwrap();
        for solver in [&RuleSolver as &dyn BlockSolver, &BacktrackSolver] {
            assert_eq!(
                solver.solve(&[0, 0], &context, Strategy::Column, 0),
                Err(SolveError::WrongLength { got: 2, expected: 4 })
            );
        }
    }
}
