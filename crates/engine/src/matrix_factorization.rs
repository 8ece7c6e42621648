//! Matrix Factorization using Alternating Least Squares (ALS)
//!
//! Implements implicit-feedback ALS: every observed entry has preference 1
//! and confidence `alpha * weight`, unobserved entries preference 0 and
//! confidence 1. Each half-step solves, per row,
//!
//! ```text
//! (YᵀY + Yᵀ(Cᵤ − I)Y + λI) xᵤ = YᵀCᵤ p(u)
//! ```
//!
//! with `YᵀY` precomputed once per half-step.

use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use recommdo_core::PipelineConfig;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::matrix::SparseMatrix;

/// ALS configuration parameters
#[derive(Debug, Clone)]
pub struct AlsConfig {
    /// Number of latent factors (embedding dimension)
    pub factors: usize,
    /// Regularization parameter (lambda)
    pub regularization: f32,
    /// Number of iterations
    pub iterations: usize,
    /// Confidence scaling for implicit feedback
    pub alpha: f32,
    /// Seed of the factor initialisation
    pub seed: u64,
}

impl Default for AlsConfig {
    fn default() -> Self {
        Self {
            factors: 64,
            regularization: 0.01,
            iterations: 15,
            alpha: 40.0,
            seed: 42,
        }
    }
}

impl From<&PipelineConfig> for AlsConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            factors: config.als_factors,
            regularization: config.als_regularization,
            iterations: config.als_iterations,
            alpha: config.als_alpha,
            seed: config.als_seed,
        }
    }
}

/// A trained latent-factor model, addressed by dense user/item codes
pub trait FactorModel: Send + Sync {
    fn num_users(&self) -> usize;

    fn num_items(&self) -> usize;

    /// Top `k` items for a user by descending score. Items the user already
    /// interacted with are not filtered out.
    fn recommend(&self, user_code: usize, k: usize) -> Vec<(usize, f32)>;

    /// Top `k` other users by cosine similarity of their factors
    fn similar_users(&self, user_code: usize, k: usize) -> Vec<(usize, f32)>;
}

/// Factors produced by [`AlsTrainer`]
#[derive(Debug, Clone)]
pub struct AlsModel {
    /// User latent factors: [num_users x factors]
    pub user_factors: Array2<f32>,
    /// Item latent factors: [num_items x factors]
    pub item_factors: Array2<f32>,
}

impl AlsModel {
    /// Predicted preference of a user for an item
    pub fn predict(&self, user_code: usize, item_code: usize) -> Option<f32> {
        if user_code >= self.user_factors.nrows() || item_code >= self.item_factors.nrows() {
            return None;
        }
        Some(
            self.user_factors
                .row(user_code)
                .dot(&self.item_factors.row(item_code)),
        )
    }
}

/// Indices of the `k` best scores, highest first, ties broken by index
fn top_k(scores: impl Iterator<Item = (usize, f32)>, k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = scores.filter(|(_, s)| !s.is_nan()).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(k);
    ranked
}

impl FactorModel for AlsModel {
    fn num_users(&self) -> usize {
        self.user_factors.nrows()
    }

    fn num_items(&self) -> usize {
        self.item_factors.nrows()
    }

    fn recommend(&self, user_code: usize, k: usize) -> Vec<(usize, f32)> {
        if user_code >= self.num_users() || k == 0 {
            return Vec::new();
        }
        let scores = self.item_factors.dot(&self.user_factors.row(user_code));
        top_k(scores.iter().copied().enumerate(), k)
    }

    fn similar_users(&self, user_code: usize, k: usize) -> Vec<(usize, f32)> {
        if user_code >= self.num_users() || k == 0 {
            return Vec::new();
        }
        let target = self.user_factors.row(user_code);
        let similarities = self
            .user_factors
            .rows()
            .into_iter()
            .enumerate()
            .filter(|(other, _)| *other != user_code)
            .map(|(other, row)| (other, cosine_similarity(target, row)));
        top_k(similarities, k)
    }
}

/// Compute cosine similarity between two embeddings
pub fn cosine_similarity(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    a.dot(&b) / (norm_a * norm_b)
}

/// Single-threaded implicit ALS trainer
pub struct AlsTrainer {
    config: AlsConfig,
}

impl AlsTrainer {
    pub fn new(config: AlsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AlsConfig {
        &self.config
    }

    /// Train on an item×user matrix of interaction weights
    pub fn fit(&self, item_user: &SparseMatrix) -> PipelineResult<AlsModel> {
        if !(self.config.regularization > 0.0) {
            return Err(PipelineError::Training(format!(
                "regularization must be positive, got {}",
                self.config.regularization
            )));
        }

        let k = self.config.factors;
        let lambda = self.config.regularization as f64;
        let alpha = self.config.alpha;
        let user_item = item_user.transpose();

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut user_factors = Array2::<f32>::zeros((user_item.rows(), k));
        let mut item_factors = Array2::<f32>::zeros((item_user.rows(), k));
        user_factors.mapv_inplace(|_| rng.gen_range(0.0..0.01));
        item_factors.mapv_inplace(|_| rng.gen_range(0.0..0.01));

        for iteration in 0..self.config.iterations {
            Self::solve_half_step(&mut user_factors, &item_factors, &user_item, lambda, alpha)
                .map_err(|e| {
                    PipelineError::Training(format!("user factors, iteration {iteration}: {e}"))
                })?;
            Self::solve_half_step(&mut item_factors, &user_factors, item_user, lambda, alpha)
                .map_err(|e| {
                    PipelineError::Training(format!("item factors, iteration {iteration}: {e}"))
                })?;

            if iteration % 2 == 0 {
                let loss = Self::compute_loss(&user_item, &user_factors, &item_factors, lambda, alpha);
                debug!(iteration, loss, "ALS iteration");
            }
        }

        Ok(AlsModel {
            user_factors,
            item_factors,
        })
    }

    /// Recompute every row of `target` against the fixed factors `fixed`.
    /// `interactions` rows index `target`, columns index `fixed`.
    fn solve_half_step(
        target: &mut Array2<f32>,
        fixed: &Array2<f32>,
        interactions: &SparseMatrix,
        lambda: f64,
        alpha: f32,
    ) -> Result<(), String> {
        let k = fixed.ncols();
        let fixed64 = fixed.mapv(|v| v as f64);
        let gram = fixed64.t().dot(&fixed64);

        for row in 0..interactions.rows() {
            let (cols, weights) = interactions.row(row);
            if cols.is_empty() {
                continue;
            }

            let mut a = gram.clone();
            let mut b = Array1::<f64>::zeros(k);

            for (col, weight) in cols.iter().zip(weights) {
                let y = fixed64.row(*col);
                let confidence = (alpha * weight) as f64;

                // A += (c - 1) * y^T y
                for i in 0..k {
                    for j in 0..k {
                        a[[i, j]] += (confidence - 1.0) * y[i] * y[j];
                    }
                }

                // b += c * p * y, with p = 1
                for i in 0..k {
                    b[i] += confidence * y[i];
                }
            }

            // Add regularization: A += lambda * I
            for i in 0..k {
                a[[i, i]] += lambda;
            }

            let x = Self::solve_least_squares(&a, &b)?;
            target.row_mut(row).assign(&x.mapv(|v| v as f32));
        }

        Ok(())
    }

    /// Solve least squares system A * x = b using Cholesky decomposition
    fn solve_least_squares(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, String> {
        let n = a.nrows();

        // Perform Cholesky decomposition: A = L * L^T
        let mut l = Array2::<f64>::zeros((n, n));

        for i in 0..n {
            for j in 0..=i {
                let mut sum = 0.0;
                for k in 0..j {
                    sum += l[[i, k]] * l[[j, k]];
                }

                if i == j {
                    let diag = a[[i, i]] - sum;
                    if diag <= 0.0 {
                        return Err("matrix is not positive definite".to_string());
                    }
                    l[[i, j]] = diag.sqrt();
                } else {
                    l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
                }
            }
        }

        // Forward substitution: L * y = b
        let mut y = Array1::<f64>::zeros(n);
        for i in 0..n {
            let mut sum = 0.0;
            for j in 0..i {
                sum += l[[i, j]] * y[j];
            }
            y[i] = (b[i] - sum) / l[[i, i]];
        }

        // Backward substitution: L^T * x = y
        let mut x = Array1::<f64>::zeros(n);
        for i in (0..n).rev() {
            let mut sum = 0.0;
            for j in (i + 1)..n {
                sum += l[[j, i]] * x[j];
            }
            x[i] = (y[i] - sum) / l[[i, i]];
        }

        Ok(x)
    }

    /// Confidence-weighted loss over the full matrix plus regularization,
    /// averaged over all cells
    fn compute_loss(
        user_item: &SparseMatrix,
        user_factors: &Array2<f32>,
        item_factors: &Array2<f32>,
        lambda: f64,
        alpha: f32,
    ) -> f64 {
        let items64 = item_factors.mapv(|v| v as f64);
        let gram = items64.t().dot(&items64);
        let mut loss = 0.0;

        for (u, x) in user_factors.rows().into_iter().enumerate() {
            let x = x.mapv(|v| v as f64);
            // Every cell treated as unobserved: x^T (Y^T Y) x
            loss += x.dot(&gram.dot(&x));

            let (cols, weights) = user_item.row(u);
            for (col, weight) in cols.iter().zip(weights) {
                let prediction = x.dot(&items64.row(*col));
                let confidence = (alpha * weight) as f64;
                loss -= prediction * prediction;
                loss += confidence * (1.0 - prediction).powi(2);
            }
        }

        let norm = |m: &Array2<f32>| m.iter().map(|v| (*v as f64).powi(2)).sum::<f64>();
        loss += lambda * (norm(user_factors) + norm(item_factors));

        let cells = (user_factors.nrows() * item_factors.nrows()).max(1) as f64;
        loss / cells
    }
}
