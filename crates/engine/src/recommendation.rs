//! Recommendation generation
//!
//! Turns a trained [`FactorModel`] into persisted [`Recommendation`] rows:
//! top-N items per coded user, decoded back to raw ids and bucketed into a
//! 1..=5 star rating.

use recommdo_core::Recommendation;
use tracing::debug;
use uuid::Uuid;

use crate::index_mapping::IndexMapping;
use crate::matrix::SparseMatrix;
use crate::matrix_factorization::FactorModel;
use crate::weighting::score_rating;

pub struct RecommendationGenerator {
    top_n: usize,
}

impl Default for RecommendationGenerator {
    fn default() -> Self {
        Self { top_n: 10 }
    }
}

impl RecommendationGenerator {
    pub fn new(top_n: usize) -> Self {
        Self { top_n }
    }

    /// One recommendation per (user, item) for every row of `user_item`
    pub fn generate(
        &self,
        project_id: Uuid,
        model: &dyn FactorModel,
        user_item: &SparseMatrix,
        users: &IndexMapping,
        items: &IndexMapping,
    ) -> Vec<Recommendation> {
        let mut recommendations = Vec::with_capacity(user_item.rows() * self.top_n);

        for user_code in 0..user_item.rows() {
            let Some(user_id) = users.decode(user_code) else {
                continue;
            };

            for (item_code, score) in model.recommend(user_code, self.top_n) {
                if let Some(item_id) = items.decode(item_code) {
                    recommendations.push(Recommendation::new(
                        project_id,
                        user_id,
                        item_id,
                        score,
                        score_rating(score),
                    ));
                }
            }
        }

        debug!(
            users = user_item.rows(),
            generated = recommendations.len(),
            "Recommendations generated"
        );
        recommendations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scores fixed per item, identical for every user
    struct FixedScores(Vec<f32>);

    impl FactorModel for FixedScores {
        fn num_users(&self) -> usize {
            2
        }

        fn num_items(&self) -> usize {
            self.0.len()
        }

        fn recommend(&self, _user_code: usize, k: usize) -> Vec<(usize, f32)> {
            let mut ranked: Vec<(usize, f32)> = self.0.iter().copied().enumerate().collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
            ranked.truncate(k);
            ranked
        }

        fn similar_users(&self, _user_code: usize, _k: usize) -> Vec<(usize, f32)> {
            Vec::new()
        }
    }

    #[test]
    fn test_generate_decodes_and_buckets() {
        let project_id = Uuid::new_v4();
        let users = IndexMapping::from_ids([100, 200]);
        let items = IndexMapping::from_ids([7, 8, 9]);
        let user_item = SparseMatrix::from_triplets(2, 3, &[(0, 0, 1.0), (1, 1, 1.0)]);
        let model = FixedScores(vec![1.2, 0.1, 0.0]);

        let recs = RecommendationGenerator::new(2).generate(
            project_id, &model, &user_item, &users, &items,
        );

        assert_eq!(recs.len(), 4);
        assert!(recs.iter().all(|r| r.project_id == project_id));

        let first = &recs[0];
        assert_eq!(first.user_id, 100);
        assert_eq!(first.item_id, 7);
        assert_eq!(first.user_item_weight, 5);

        let second = &recs[1];
        assert_eq!(second.item_id, 8);
        assert_eq!(second.user_item_weight, 3);
    }

    #[test]
    fn test_known_interactions_are_not_filtered() {
        let users = IndexMapping::from_ids([1]);
        let items = IndexMapping::from_ids([10]);
        let user_item = SparseMatrix::from_triplets(1, 1, &[(0, 0, 1.0)]);
        let model = FixedScores(vec![0.9]);

        let recs = RecommendationGenerator::default().generate(
            Uuid::new_v4(),
            &model,
            &user_item,
            &users,
            &items,
        );
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].item_id, 10);
    }
}
