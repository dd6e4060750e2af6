//! Win verification for bingo cards.
//!
//! `has_bingo` is a pure function over a card grid and a called-number set;
//! it is the single source of truth for every settlement decision and is
//! deliberately free of any I/O or shared state.

use crate::types::CardGrid;

/// Cell indexes (1-based, row-major 1..=25) of the main diagonal.
const MAIN_DIAGONAL: [u8; 5] = [1, 7, 13, 19, 25];
/// Cell indexes of the anti-diagonal.
const ANTI_DIAGONAL: [u8; 5] = [5, 9, 13, 17, 21];
/// Cell indexes of the four outer corners.
const OUTER_CORNERS: [u8; 4] = [1, 5, 21, 25];
/// Cell indexes of the four inner corners.
const INNER_CORNERS: [u8; 4] = [7, 9, 17, 19];

/// Check a card against the called numbers.
///
/// Returns the union of 1-based cell indexes belonging to every satisfied
/// pattern (rows, columns, both diagonals, outer corners, inner corners),
/// sorted and deduplicated. Empty iff no pattern is covered. The center cell
/// (value 0) counts as permanently called.
pub fn has_bingo(card: &CardGrid, called_numbers: &[u8]) -> Vec<u8> {
    let covered = |row: usize, col: usize| -> bool {
        let value = card[row][col];
        value == 0 || called_numbers.contains(&value)
    };
    let cell_index = |row: usize, col: usize| -> u8 { (row * 5 + col) as u8 + 1 };

    let mut winning: Vec<u8> = Vec::new();

    // Rows.
    for row in 0..5 {
        if (0..5).all(|col| covered(row, col)) {
            winning.extend((0..5).map(|col| cell_index(row, col)));
        }
    }

    // Columns.
    for col in 0..5 {
        if (0..5).all(|row| covered(row, col)) {
            winning.extend((0..5).map(|row| cell_index(row, col)));
        }
    }

    // Diagonals.
    if (0..5).all(|i| covered(i, i)) {
        winning.extend(MAIN_DIAGONAL);
    }
    if (0..5).all(|i| covered(i, 4 - i)) {
        winning.extend(ANTI_DIAGONAL);
    }

    // Corner sets.
    if covered(0, 0) && covered(0, 4) && covered(4, 0) && covered(4, 4) {
        winning.extend(OUTER_CORNERS);
    }
    if covered(1, 1) && covered(1, 3) && covered(3, 1) && covered(3, 3) {
        winning.extend(INNER_CORNERS);
    }

    winning.sort_unstable();
    winning.dedup();
    winning
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The reference card used by the acceptance scenarios: sequential
    /// values with the free center.
    fn sequential_card() -> CardGrid {
        [
            [1, 2, 3, 4, 5],
            [6, 7, 8, 9, 10],
            [11, 12, 0, 14, 15],
            [16, 17, 18, 19, 20],
            [21, 22, 23, 24, 25],
        ]
    }

    #[test]
    fn test_row_win_returns_row_cells() {
        // Scenario A: top row called -> exactly that row's cell indexes.
        let result = has_bingo(&sequential_card(), &[1, 2, 3, 4, 5, 0]);
        assert_eq!(result, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_diagonal_win_returns_diagonal_cells() {
        // Scenario B: main diagonal (center is free).
        let result = has_bingo(&sequential_card(), &[1, 7, 13, 19, 25, 0]);
        assert_eq!(result, vec![1, 7, 13, 19, 25]);
    }

    #[test]
    fn test_no_win_is_empty() {
        assert!(has_bingo(&sequential_card(), &[]).is_empty());
        assert!(has_bingo(&sequential_card(), &[1, 2, 3, 4]).is_empty());
    }

    #[test]
    fn test_center_cell_is_free() {
        // Middle row needs only the four non-center values.
        let result = has_bingo(&sequential_card(), &[11, 12, 14, 15]);
        assert_eq!(result, vec![11, 12, 13, 14, 15]);
        // Middle column likewise.
        let result = has_bingo(&sequential_card(), &[3, 8, 18, 23]);
        assert_eq!(result, vec![3, 8, 13, 18, 23]);
    }

    #[test]
    fn test_column_win() {
        let result = has_bingo(&sequential_card(), &[1, 6, 11, 16, 21]);
        assert_eq!(result, vec![1, 6, 11, 16, 21]);
    }

    #[test]
    fn test_anti_diagonal_win() {
        let result = has_bingo(&sequential_card(), &[5, 9, 17, 21]);
        assert_eq!(result, vec![5, 9, 13, 17, 21]);
    }

    #[test]
    fn test_outer_corners() {
        let result = has_bingo(&sequential_card(), &[1, 5, 21, 25]);
        assert_eq!(result, vec![1, 5, 21, 25]);
    }

    #[test]
    fn test_inner_corners() {
        let result = has_bingo(&sequential_card(), &[7, 9, 17, 19]);
        assert_eq!(result, vec![7, 9, 17, 19]);
    }

    #[test]
    fn test_multiple_patterns_union() {
        // Top row plus left column at once: union of both cell sets.
        let result = has_bingo(&sequential_card(), &[1, 2, 3, 4, 5, 6, 11, 16, 21]);
        assert_eq!(result, vec![1, 2, 3, 4, 5, 6, 11, 16, 21]);
    }

    #[test]
    fn test_full_card_returns_all_cells() {
        let called: Vec<u8> = (1..=25).collect();
        let result = has_bingo(&sequential_card(), &called);
        assert_eq!(result, (1..=25).collect::<Vec<u8>>());
    }

    #[test]
    fn test_deterministic() {
        let called = [1, 7, 13, 19, 25];
        let a = has_bingo(&sequential_card(), &called);
        let b = has_bingo(&sequential_card(), &called);
        assert_eq!(a, b);
    }

    #[test]
    fn test_every_single_pattern_is_detected() {
        // Property: for each of the 14 patterns, calling exactly the values
        // of that pattern (minus the free center) yields a non-empty result
        // containing the pattern's cells.
        let card = sequential_card();
        let mut patterns: Vec<Vec<(usize, usize)>> = Vec::new();
        for row in 0..5 {
            patterns.push((0..5).map(|c| (row, c)).collect());
        }
        for col in 0..5 {
            patterns.push((0..5).map(|r| (r, col)).collect());
        }
        patterns.push((0..5).map(|i| (i, i)).collect());
        patterns.push((0..5).map(|i| (i, 4 - i)).collect());
        patterns.push(vec![(0, 0), (0, 4), (4, 0), (4, 4)]);
        patterns.push(vec![(1, 1), (1, 3), (3, 1), (3, 3)]);
        assert_eq!(patterns.len(), 14);

        for pattern in patterns {
            let called: Vec<u8> = pattern
                .iter()
                .map(|&(r, c)| card[r][c])
                .filter(|&v| v != 0)
                .collect();
            let result = has_bingo(&card, &called);
            assert!(!result.is_empty(), "pattern {pattern:?} not detected");
            for &(r, c) in &pattern {
                let idx = (r * 5 + c) as u8 + 1;
                assert!(result.contains(&idx), "cell {idx} missing for {pattern:?}");
            }
        }
    }

    #[test]
    fn test_near_misses_never_win() {
        // Property: dropping any one (non-free) cell from a pattern breaks it,
        // provided the remaining calls complete no other pattern.
        let card = sequential_card();
        // Top row minus one cell each way.
        for missing in [1u8, 2, 3, 4, 5] {
            let called: Vec<u8> = [1u8, 2, 3, 4, 5]
                .iter()
                .copied()
                .filter(|&v| v != missing)
                .collect();
            assert!(
                has_bingo(&card, &called).is_empty(),
                "row should not win without {missing}"
            );
        }
    }
}
