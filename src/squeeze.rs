//! Feature squeezing: reduce input bit depth so that small perturbations collapse onto the
//! same quantization level.

use anyhow::{Result, ensure};
use burn::prelude::*;

#[derive(Config, Debug)]
pub struct FeatureSqueezingConfig {
    #[config(default = 1)]
    pub bit_depth: u32,
    #[config(default = 0.0)]
    pub clip_min: f64,
    #[config(default = 1.0)]
    pub clip_max: f64,
}

impl FeatureSqueezingConfig {
    pub fn init(&self) -> Result<FeatureSqueezing> {
        ensure!(
            (1..=64).contains(&self.bit_depth),
            "bit depth must be within 1..=64, got {}",
            self.bit_depth
        );
        ensure!(
            self.clip_min < self.clip_max,
            "clip range must be increasing, got ({}, {})",
            self.clip_min,
            self.clip_max
        );

        Ok(FeatureSqueezing {
            levels: 2f64.powi(self.bit_depth as i32) - 1.0,
            clip_min: self.clip_min,
            clip_max: self.clip_max,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FeatureSqueezing {
    levels: f64,
    clip_min: f64,
    clip_max: f64,
}

impl FeatureSqueezing {
    pub fn squeeze<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let range = self.clip_max - self.clip_min;

        x.sub_scalar(self.clip_min)
            .div_scalar(range)
            .mul_scalar(self.levels)
            .round()
            .div_scalar(self.levels)
            .mul_scalar(range)
            .add_scalar(self.clip_min)
            .clamp(self.clip_min, self.clip_max)
    }
}
