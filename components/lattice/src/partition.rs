use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Board;

/// How a board is cut into sub-jobs: one per column, or one per block.
/// Either way a board of side N yields at most N partitions of N cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Column,
    Block,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Column => write!(f, "column"),
            Strategy::Block => write!(f, "block"),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "column" => Ok(Strategy::Column),
            "block" => Ok(Strategy::Block),
            other => Err(format!("unknown strategy '{other}' (expected column or block)")),
        }
    }
}

/// Cell coordinates of partition `index`, in value-vector order.
///
/// Columns run top-down; blocks are flattened row-major, both across the
/// board (`index = band * blocks_per_band + stack`) and within the block.
pub fn partition_cells(board: &Board, strategy: Strategy, index: u32) -> Vec<(usize, usize)> {
    let n = board.side();
    let (r_blk, c_blk) = board.block_shape();
    match strategy {
        Strategy::Column => {
            let col = index as usize;
            (0..n).map(|row| (row, col)).collect()
        }
        Strategy::Block => {
            // blocks_per_band = n / c_blk = r_blk, because n = r_blk * c_blk
            let band = index as usize / r_blk;
            let stack = index as usize % r_blk;
            let mut cells = Vec::with_capacity(n);
            for r in 0..r_blk {
                for c in 0..c_blk {
                    cells.push((band * r_blk + r, stack * c_blk + c));
                }
            }
            cells
        }
    }
}

pub fn extract(board: &Board, strategy: Strategy, index: u32) -> Vec<u8> {
    partition_cells(board, strategy, index)
        .into_iter()
        .map(|(r, c)| board.get(r, c))
        .collect()
}

pub fn overlay(board: &mut Board, strategy: Strategy, index: u32, values: &[u8]) {
    for (&(r, c), &v) in partition_cells(board, strategy, index).iter().zip(values) {
        board.set(r, c, v);
    }
}

/// Splits a board into sub-job payloads: `(partition index, values)` for
/// every partition still holding a zero. Fully-filled partitions carry no
/// work and are skipped.
pub fn partition(board: &Board, strategy: Strategy) -> Vec<(u32, Vec<u8>)> {
    (0..board.side() as u32)
        .filter_map(|index| {
            let values = extract(board, strategy, index);
            values.iter().any(|&v| v == 0).then_some((index, values))
        })
        .collect()
}

/// Seeds a fully blank board by filling partition 0 with `1..=N`.
///
/// Any completed grid can be relabeled so its first column (or first
/// block) matches this seed, so no solution is excluded. Returns whether
/// a seed was written.
pub fn seed_if_blank(board: &mut Board, strategy: Strategy) -> bool {
    if !board.is_blank() {
        return false;
    }
    for (i, (r, c)) in partition_cells(board, strategy, 0).into_iter().enumerate() {
        board.set(r, c, i as u8 + 1);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_4() -> Board {
        Board::from_rows(&[
            vec![1, 0, 3, 4],
            vec![3, 4, 0, 2],
            vec![2, 1, 4, 3],
            vec![0, 3, 2, 1],
        ])
        .unwrap()
    }

    #[test]
    fn column_partitions_skip_filled_columns() {
        let parts = partition(&sample_4(), Strategy::Column);
        let indices: Vec<u32> = parts.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2]); // column 3 is full
        assert_eq!(parts[0].1, vec![1, 3, 2, 0]);
    }

    #[test]
    fn block_partitions_skip_filled_blocks() {
        let parts = partition(&sample_4(), Strategy::Block);
        let indices: Vec<u32> = parts.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2]); // block 3 (bottom-right) is full
        assert_eq!(parts[0].1, vec![1, 0, 3, 4]);
    }

    #[test]
    fn block_cells_flatten_row_major() {
        let board = Board::blank(6).unwrap(); // 2x3 blocks, 3 per column of bands
        assert_eq!(
            partition_cells(&board, Strategy::Block, 3),
            vec![(2, 3), (2, 4), (2, 5), (3, 3), (3, 4), (3, 5)]
        );
    }

    #[test]
    fn partitions_reassemble_the_board() {
        for strategy in [Strategy::Column, Strategy::Block] {
            let original = sample_4();
            let mut rebuilt = Board::blank(4).unwrap();
            for index in 0..original.side() as u32 {
                let values = extract(&original, strategy, index);
                overlay(&mut rebuilt, strategy, index, &values);
            }
            assert_eq!(rebuilt, original);
        }
    }

    #[test]
    fn seeds_only_blank_boards() {
        let mut board = Board::blank(9).unwrap();
        assert!(seed_if_blank(&mut board, Strategy::Column));
        for row in 0..9 {
            assert_eq!(board.get(row, 0), row as u8 + 1);
        }
        assert!(board.is_well_formed());
        assert!(!seed_if_blank(&mut board, Strategy::Column));

        let mut board = Board::blank(9).unwrap();
        assert!(seed_if_blank(&mut board, Strategy::Block));
        assert_eq!(board.get(0, 0), 1);
        assert_eq!(board.get(0, 2), 3);
        assert_eq!(board.get(2, 2), 9);
        assert!(board.is_well_formed());
    }

    #[test]
    fn strategy_round_trips_as_text() {
        assert_eq!("column".parse::<Strategy>().unwrap(), Strategy::Column);
        assert_eq!("BLOCK".parse::<Strategy>().unwrap(), Strategy::Block);
        assert!("rows".parse::<Strategy>().is_err());
        assert_eq!(Strategy::Column.to_string(), "column");
    }
}
