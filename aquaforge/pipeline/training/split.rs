use std::ops::Range;

/// Temporal train/holdout split over rows already in date order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporalSplit {
    /// Leading rows used for fitting.
    pub train: Range<usize>,
    /// Trailing rows used for scoring.
    pub holdout: Range<usize>,
}

impl TemporalSplit {
    /// Holds out the trailing `fraction` of `rows`, keeping at least one row on each side.
    /// Returns `None` below two rows.
    #[must_use]
    pub fn trailing(rows: usize, fraction: f64) -> Option<Self> {
        if rows < 2 {
            return None;
        }
        let wanted = (rows as f64 * fraction.clamp(0.0, 1.0)).round() as usize;
        let holdout = wanted.clamp(1, rows - 1);
        let cut = rows - holdout;
        Some(Self {
            train: 0..cut,
            holdout: cut..rows,
        })
    }

    /// True when a row position falls in the training part.
    #[must_use]
    pub fn is_train(&self, position: usize) -> bool {
        self.train.contains(&position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_out_the_tail() {
        let split = TemporalSplit::trailing(100, 0.2).unwrap();
        assert_eq!(split.train, 0..80);
        assert_eq!(split.holdout, 80..100);
        assert!(split.is_train(79));
        assert!(!split.is_train(80));
    }

    #[test]
    fn keeps_both_sides_non_empty() {
        assert_eq!(TemporalSplit::trailing(3, 0.01).unwrap().holdout, 2..3);
        assert_eq!(TemporalSplit::trailing(3, 0.99).unwrap().train, 0..1);
        assert!(TemporalSplit::trailing(1, 0.2).is_none());
    }
}
