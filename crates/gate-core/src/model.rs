//! Model catalog types and target-model resolution

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Criticality class of a declared model.
///
/// Sheddable requests may be rejected under load so critical ones proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Criticality {
    Critical,
    Sheddable,
}

/// One weighted target-model variant a logical model may resolve to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetModel {
    pub name: String,
    pub weight: u32,
}

/// A declared logical model in the pool's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceModel {
    /// Control-plane object name; deletes arrive keyed by this
    pub name: String,

    /// Logical model name clients request; primary key within the pool
    pub model_name: String,

    /// Criticality class; absent means sheddable
    #[serde(default)]
    pub criticality: Option<Criticality>,

    /// Weighted target variants; empty means requests pass through unchanged
    #[serde(default)]
    pub target_models: Vec<TargetModel>,

    /// Name of the pool this model is declared for
    pub pool_name: String,
}

impl InferenceModel {
    /// Whether requests for this model are treated as critical
    pub fn is_critical(&self) -> bool {
        self.criticality == Some(Criticality::Critical)
    }

    /// Validate the catalog invariants for this model.
    pub fn validate(&self) -> crate::Result<()> {
        if self.model_name.is_empty() {
            return Err(crate::Error::invalid_request(format!(
                "model {} declares an empty model name",
                self.name
            )));
        }
        if !self.target_models.is_empty() && self.total_weight() == 0 {
            return Err(crate::Error::invalid_request(format!(
                "model {} declares target models but all weights are zero",
                self.model_name
            )));
        }
        Ok(())
    }

    fn total_weight(&self) -> u64 {
        self.target_models.iter().map(|t| u64::from(t.weight)).sum()
    }

    /// Draw one target-model name with probability proportional to its
    /// weight. Returns `None` when no target models are declared or every
    /// weight is zero.
    pub fn weighted_draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        let total = self.total_weight();
        if total == 0 {
            return None;
        }
        let mut remaining = rng.gen_range(0..total);
        for target in &self.target_models {
            let weight = u64::from(target.weight);
            if remaining < weight {
                return Some(&target.name);
            }
            remaining -= weight;
        }
        // Unreachable: remaining < total and the weights sum to total.
        None
    }
}
