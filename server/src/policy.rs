//! Automated controllers for policy-driven entities.
//!
//! A policy maps one observation to one action and holds no per-tick state,
//! so the scheduler can call it for any entity at any time.

use std::path::Path;

use blob_shared::types::Action;
use serde::Deserialize;

use crate::world::Observation;

/// Opaque handle selecting a policy out of a [`PolicySet`]
pub type PolicyId = usize;

pub trait Policy: Send {
    fn predict(&self, observation: &Observation) -> Action;
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read weights: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse weights: {0}")]
    Json(#[from] serde_json::Error),
    #[error("layer {layer}: {detail}")]
    Shape { layer: &'static str, detail: String },
}

/// Heads straight for the nearest collectible.
///
/// Steers towards the sign of the relative food angle, holding course once
/// it is within `tolerance` radians.
#[derive(Debug, Clone, Copy)]
pub struct SeekFoodPolicy {
    pub tolerance: f32,
}

impl Default for SeekFoodPolicy {
    fn default() -> Self {
        Self { tolerance: 0.1 }
    }
}

impl Policy for SeekFoodPolicy {
    fn predict(&self, observation: &Observation) -> Action {
        let angle = observation[7];
        if angle > self.tolerance {
            Action::TurnPositive
        } else if angle < -self.tolerance {
            Action::TurnNegative
        } else {
            Action::Straight
        }
    }
}

#[derive(Debug, Clone)]
struct Dense {
    /// `[out][in]`, the layout the trainer exports
    weight: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

impl Dense {
    fn inputs(&self) -> usize {
        self.weight.first().map_or(0, Vec::len)
    }

    fn outputs(&self) -> usize {
        self.bias.len()
    }

    fn check(&self, layer: &'static str) -> Result<(), PolicyError> {
        if self.weight.len() != self.bias.len() {
            return Err(PolicyError::Shape {
                layer,
                detail: format!("{} weight rows for {} biases", self.weight.len(), self.bias.len()),
            });
        }
        let inputs = self.inputs();
        if inputs == 0 || self.weight.iter().any(|row| row.len() != inputs) {
            return Err(PolicyError::Shape {
                layer,
                detail: "ragged or empty weight matrix".to_string(),
            });
        }
        Ok(())
    }

    fn forward(&self, input: &[f32], relu: bool) -> Vec<f32> {
        self.weight
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| {
                let z = row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>() + b;
                if relu {
                    z.max(0.0)
                } else {
                    z
                }
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct WeightsFile {
    #[serde(rename = "fc1.weight")]
    fc1_weight: Vec<Vec<f32>>,
    #[serde(rename = "fc1.bias")]
    fc1_bias: Vec<f32>,
    #[serde(rename = "fc2.weight")]
    fc2_weight: Vec<Vec<f32>>,
    #[serde(rename = "fc2.bias")]
    fc2_bias: Vec<f32>,
    #[serde(rename = "fc3.weight")]
    fc3_weight: Vec<Vec<f32>>,
    #[serde(rename = "fc3.bias")]
    fc3_bias: Vec<f32>,
}

/// Three-layer perceptron with ReLU hidden layers, picking the arg-max
/// output. Two-output networks only ever turn; three-output networks may
/// also hold course.
#[derive(Debug, Clone)]
pub struct MlpPolicy {
    layers: [Dense; 3],
}

impl MlpPolicy {
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let file: WeightsFile = serde_json::from_str(json)?;
        let layers = [
            Dense {
                weight: file.fc1_weight,
                bias: file.fc1_bias,
            },
            Dense {
                weight: file.fc2_weight,
                bias: file.fc2_bias,
            },
            Dense {
                weight: file.fc3_weight,
                bias: file.fc3_bias,
            },
        ];
        for (layer, name) in layers.iter().zip(["fc1", "fc2", "fc3"]) {
            layer.check(name)?;
        }
        if layers[0].inputs() != Observation::default().len() {
            return Err(PolicyError::Shape {
                layer: "fc1",
                detail: format!("expects {} inputs", layers[0].inputs()),
            });
        }
        for (i, name) in [(1, "fc2"), (2, "fc3")] {
            if layers[i].inputs() != layers[i - 1].outputs() {
                return Err(PolicyError::Shape {
                    layer: name,
                    detail: format!(
                        "takes {} inputs but previous layer yields {}",
                        layers[i].inputs(),
                        layers[i - 1].outputs()
                    ),
                });
            }
        }
        if !(2..=3).contains(&layers[2].outputs()) {
            return Err(PolicyError::Shape {
                layer: "fc3",
                detail: format!("{} outputs, expected 2 or 3", layers[2].outputs()),
            });
        }
        Ok(Self { layers })
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    fn q_values(&self, observation: &Observation) -> Vec<f32> {
        let h1 = self.layers[0].forward(observation, true);
        let h2 = self.layers[1].forward(&h1, true);
        self.layers[2].forward(&h2, false)
    }
}

impl Policy for MlpPolicy {
    fn predict(&self, observation: &Observation) -> Action {
        let q = self.q_values(observation);
        let best = q
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(bi, bq), (i, &v)| {
                if v > bq {
                    (i, v)
                } else {
                    (bi, bq)
                }
            })
            .0;
        Action::from_index(best).unwrap_or_default()
    }
}

/// Policies for every policy-driven entity, indexed by [`PolicyId`].
pub struct PolicySet {
    policies: Vec<Box<dyn Policy>>,
    fallback: SeekFoodPolicy,
}

impl PolicySet {
    pub fn new(policies: Vec<Box<dyn Policy>>) -> Self {
        Self {
            policies,
            fallback: SeekFoodPolicy::default(),
        }
    }

    /// `count` policies loaded from `paths` (cycled). Any path that fails to
    /// load, or a missing path list, yields the food-seeking heuristic.
    pub fn load(count: usize, paths: &[impl AsRef<Path>]) -> Self {
        let policies = (0..count)
            .map(|id| -> Box<dyn Policy> {
                if paths.is_empty() {
                    return Box::new(SeekFoodPolicy::default());
                }
                let path = paths[id % paths.len()].as_ref();
                match MlpPolicy::load(path) {
                    Ok(mlp) => {
                        tracing::info!("Policy {} loaded from {}", id, path.display());
                        Box::new(mlp)
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Policy {} falling back to food seeking ({}): {}",
                            id,
                            path.display(),
                            e
                        );
                        Box::new(SeekFoodPolicy::default())
                    }
                }
            })
            .collect();
        Self::new(policies)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Unknown ids are served by the fallback heuristic.
    pub fn predict(&self, id: PolicyId, observation: &Observation) -> Action {
        match self.policies.get(id) {
            Some(policy) => policy.predict(observation),
            None => self.fallback.predict(observation),
        }
    }
}
