//! Sparse interaction matrices
//!
//! [`MatrixBuilder`] turns the raw streams of a run into:
//!
//! - deduplicated, weighted `(user, item)` interactions (persisted as purchases)
//! - an item×user CSR matrix used for training
//! - its user×item transpose used for recommendation
//! - the index mappings that decode matrix codes back to raw ids

use std::collections::{HashMap, HashSet};

use recommdo_core::FileKind;
use tracing::debug;

use crate::dataset::{CatalogRow, InteractionCount};
use crate::error::{PipelineError, PipelineResult};
use crate::index_mapping::IndexMapping;
use crate::weighting::interaction_weight;

/// Compressed sparse row matrix
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    rows: usize,
    cols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f32>,
}

impl SparseMatrix {
    /// Build from `(row, col, value)` triplets. Duplicate coordinates are
    /// summed; out-of-bounds coordinates are ignored.
    pub fn from_triplets(rows: usize, cols: usize, triplets: &[(usize, usize, f32)]) -> Self {
        let mut per_row: Vec<Vec<(usize, f32)>> = vec![Vec::new(); rows];
        for &(r, c, v) in triplets {
            if r < rows && c < cols {
                per_row[r].push((c, v));
            }
        }

        let mut indptr = Vec::with_capacity(rows + 1);
        let mut indices = Vec::with_capacity(triplets.len());
        let mut data = Vec::with_capacity(triplets.len());
        indptr.push(0);

        for mut entries in per_row {
            entries.sort_by_key(|(c, _)| *c);
            for (c, v) in entries {
                if indices.len() > *indptr.last().unwrap_or(&0) && indices.last() == Some(&c) {
                    if let Some(last) = data.last_mut() {
                        *last += v;
                    }
                } else {
                    indices.push(c);
                    data.push(v);
                }
            }
            indptr.push(indices.len());
        }

        Self {
            rows,
            cols,
            indptr,
            indices,
            data,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of stored entries
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Column indices and values of one row
    pub fn row(&self, r: usize) -> (&[usize], &[f32]) {
        if r >= self.rows {
            return (&[], &[]);
        }
        let (start, end) = (self.indptr[r], self.indptr[r + 1]);
        (&self.indices[start..end], &self.data[start..end])
    }

    pub fn get(&self, r: usize, c: usize) -> f32 {
        let (cols, values) = self.row(r);
        cols.binary_search(&c).map(|i| values[i]).unwrap_or(0.0)
    }

    pub fn transpose(&self) -> Self {
        let mut triplets = Vec::with_capacity(self.nnz());
        for r in 0..self.rows {
            let (cols, values) = self.row(r);
            for (c, v) in cols.iter().zip(values) {
                triplets.push((*c, r, *v));
            }
        }
        Self::from_triplets(self.cols, self.rows, &triplets)
    }
}

/// A deduplicated interaction with its intensity bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightedInteraction {
    pub user_id: i64,
    pub item_id: i64,
    pub weight: i32,
}

/// Everything a run derives from its input streams
#[derive(Debug, Clone)]
pub struct InteractionMatrix {
    pub interactions: Vec<WeightedInteraction>,
    /// Rows are item codes, columns user codes
    pub item_user: SparseMatrix,
    /// Rows are user codes, columns item codes
    pub user_item: SparseMatrix,
    pub users: IndexMapping,
    pub items: IndexMapping,
}

pub struct MatrixBuilder;

impl MatrixBuilder {
    /// Aggregate, join, weight and encode the input streams.
    ///
    /// Interactions whose item is not in the catalog are dropped.
    pub fn build(
        catalog: Option<&[CatalogRow]>,
        interactions: Option<&[InteractionCount]>,
    ) -> PipelineResult<InteractionMatrix> {
        let catalog = catalog.ok_or(PipelineError::MissingRequiredFile {
            stream: FileKind::Catalog,
        })?;
        let interactions = interactions.ok_or(PipelineError::MissingRequiredFile {
            stream: FileKind::Interactions,
        })?;

        // Sum counts per pair, keeping first-appearance order
        let mut positions: HashMap<(i64, i64), usize> = HashMap::new();
        let mut totals: Vec<(i64, i64, u64)> = Vec::new();
        for row in interactions {
            match positions.get(&(row.user_id, row.item_id)) {
                Some(&i) => totals[i].2 = totals[i].2.saturating_add(row.count),
                None => {
                    positions.insert((row.user_id, row.item_id), totals.len());
                    totals.push((row.user_id, row.item_id, row.count));
                }
            }
        }

        let known_items: HashSet<i64> = catalog.iter().map(|row| row.meta_id).collect();
        let before = totals.len();
        totals.retain(|(_, item_id, _)| known_items.contains(item_id));
        let discarded = before - totals.len();
        if discarded > 0 {
            debug!(discarded, "Dropped interactions with unknown items");
        }

        if totals.is_empty() {
            return Err(PipelineError::EmptyInteractionSet);
        }

        let interactions: Vec<WeightedInteraction> = totals
            .into_iter()
            .map(|(user_id, item_id, count)| WeightedInteraction {
                user_id,
                item_id,
                weight: interaction_weight(count),
            })
            .collect();

        let users = IndexMapping::from_ids(interactions.iter().map(|i| i.user_id));
        let items = IndexMapping::from_ids(interactions.iter().map(|i| i.item_id));

        let triplets: Vec<(usize, usize, f32)> = interactions
            .iter()
            .filter_map(|i| {
                let item = items.code(i.item_id)?;
                let user = users.code(i.user_id)?;
                Some((item, user, i.weight as f32))
            })
            .collect();

        let item_user = SparseMatrix::from_triplets(items.len(), users.len(), &triplets);
        let user_item = item_user.transpose();

        debug!(
            users = users.len(),
            items = items.len(),
            nnz = item_user.nnz(),
            "Interaction matrix built"
        );

        Ok(InteractionMatrix {
            interactions,
            item_user,
            user_item,
            users,
            items,
        })
    }
}
