//! Sampling configuration and the sampler chain it describes.

use serde::{Deserialize, Serialize};

/// llama.cpp's "pick a random seed" value.
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// Tokens considered by the repetition penalty.
pub const PENALTY_LAST_N: i32 = 64;

/// User-facing sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Always take the most likely token.
    #[serde(default)]
    pub greedy: bool,
    #[serde(default = "default_temp")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default)]
    pub seed: Option<u32>,
}

fn default_temp() -> f32 {
    0.8
}
fn default_top_k() -> i32 {
    40
}
fn default_top_p() -> f32 {
    0.95
}
fn default_repeat_penalty() -> f32 {
    1.1
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            greedy: false,
            temperature: default_temp(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            seed: None,
        }
    }
}

/// One link of a sampler chain, in application order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerStage {
    Greedy,
    Penalties { last_n: i32, repeat: f32 },
    TopK(i32),
    TopP(f32),
    Temperature(f32),
    Distribution { seed: u32 },
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            greedy: true,
            ..Default::default()
        }
    }

    /// The chain these parameters describe.
    pub fn stages(&self) -> Vec<SamplerStage> {
        if self.greedy || self.temperature <= 0.0 {
            return vec![SamplerStage::Greedy];
        }

        let mut stages = Vec::with_capacity(5);
        if self.repeat_penalty > 0.0 && self.repeat_penalty != 1.0 {
            stages.push(SamplerStage::Penalties {
                last_n: PENALTY_LAST_N,
                repeat: self.repeat_penalty,
            });
        }
        if self.top_k > 0 {
            stages.push(SamplerStage::TopK(self.top_k));
        }
        if self.top_p > 0.0 && self.top_p < 1.0 {
            stages.push(SamplerStage::TopP(self.top_p));
        }
        stages.push(SamplerStage::Temperature(self.temperature));
        stages.push(SamplerStage::Distribution {
            seed: self.seed.unwrap_or(DEFAULT_SEED),
        });
        stages
    }
}
