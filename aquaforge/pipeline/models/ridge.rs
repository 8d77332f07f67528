use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::{check_shapes, FittedState, ModelKind, ModelProvider, ProviderError};

/// Ridge regression on standardised features, solved in closed form.
#[derive(Debug, Clone)]
pub struct RidgeProvider {
    lambda: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RidgeParams {
    means: Vec<f64>,
    scales: Vec<f64>,
    weights: Vec<f64>,
    intercept: f64,
}

impl RidgeProvider {
    /// Creates a provider with the given penalty.
    #[must_use]
    pub fn new(lambda: f64) -> Self {
        Self {
            lambda: lambda.max(0.0),
        }
    }
}

impl ModelProvider for RidgeProvider {
    fn kind(&self) -> ModelKind {
        ModelKind::Ridge
    }

    fn fit(
        &self,
        features: ArrayView2<'_, f64>,
        target: ArrayView1<'_, f64>,
    ) -> Result<FittedState, ProviderError> {
        check_shapes(features, target)?;
        let n = features.nrows() as f64;
        let width = features.ncols();

        let means: Vec<f64> = (0..width)
            .map(|col| features.column(col).sum() / n)
            .collect();
        let scales: Vec<f64> = (0..width)
            .map(|col| {
                let column = features.column(col);
                let var = column.iter().map(|v| (v - means[col]).powi(2)).sum::<f64>() / n;
                if var > f64::EPSILON {
                    var.sqrt()
                } else {
                    1.0
                }
            })
            .collect();
        let mut scaled = Array2::<f64>::zeros((features.nrows(), width));
        for ((row, col), value) in features.indexed_iter() {
            scaled[[row, col]] = (value - means[col]) / scales[col];
        }
        let intercept = target.sum() / n;
        let centred = target.mapv(|y| y - intercept);

        let mut gram = scaled.t().dot(&scaled);
        for idx in 0..width {
            gram[[idx, idx]] += self.lambda.max(1e-9);
        }
        let rhs = scaled.t().dot(&centred);
        let weights = solve(gram, rhs)?;

        FittedState::encode(&RidgeParams {
            means,
            scales,
            weights: weights.to_vec(),
            intercept,
        })
    }

    fn predict(
        &self,
        state: &FittedState,
        features: ArrayView2<'_, f64>,
    ) -> Result<Array1<f64>, ProviderError> {
        let params: RidgeParams = state.decode()?;
        if features.ncols() != params.weights.len() {
            return Err(ProviderError::InvalidInput(format!(
                "model expects {} features, got {}",
                params.weights.len(),
                features.ncols()
            )));
        }
        Ok(features.map_axis(Axis(1), |row| {
            row.iter()
                .enumerate()
                .map(|(col, value)| (value - params.means[col]) / params.scales[col] * params.weights[col])
                .sum::<f64>()
                + params.intercept
        }))
    }
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Result<Array1<f64>, ProviderError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|x, y| a[[*x, col]].abs().total_cmp(&a[[*y, col]].abs()))
            .unwrap_or(col);
        if a[[pivot, col]].abs() < 1e-12 {
            return Err(ProviderError::Numerical("singular normal equations".into()));
        }
        if pivot != col {
            for k in 0..n {
                a.swap([col, k], [pivot, k]);
            }
            b.swap(col, pivot);
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[[row, k]] * x[k]).sum();
        x[row] = (b[row] - tail) / a[[row, row]];
    }
    if x.iter().any(|value| !value.is_finite()) {
        return Err(ProviderError::Numerical("non-finite ridge weights".into()));
    }
    Ok(x)
}
