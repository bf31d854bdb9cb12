use anyhow::{Result, ensure};
use burn::{
    prelude::*,
    tensor::{Int, backend::AutodiffBackend},
};

use super::{Attack, check_clip_range, loss_gradient};
use crate::resnet::ResNet;

#[derive(Config, Debug)]
pub struct FgsmConfig {
    /// L∞ perturbation budget.
    #[config(default = 0.2)]
    pub epsilon: f64,
    #[config(default = 0.0)]
    pub clip_min: f64,
    #[config(default = 1.0)]
    pub clip_max: f64,
}

impl FgsmConfig {
    pub fn init(&self) -> Result<Fgsm> {
        ensure!(
            self.epsilon >= 0.0,
            "epsilon must be non-negative, got {}",
            self.epsilon
        );
        check_clip_range(self.clip_min, self.clip_max)?;

        Ok(Fgsm {
            epsilon: self.epsilon,
            clip_min: self.clip_min,
            clip_max: self.clip_max,
        })
    }
}

/// Fast Gradient Sign Method: a single step of size `epsilon` along the sign of the
/// input gradient.
#[derive(Debug, Clone)]
pub struct Fgsm {
    epsilon: f64,
    clip_min: f64,
    clip_max: f64,
}

impl<B: AutodiffBackend> Attack<B> for Fgsm {
    fn name(&self) -> &'static str {
        "FGSM"
    }

    fn generate(
        &self,
        model: &ResNet<B>,
        images: Tensor<B::InnerBackend, 4>,
        labels: Tensor<B::InnerBackend, 1, Int>,
    ) -> Result<Tensor<B::InnerBackend, 4>> {
        let grad = loss_gradient(model, images.clone(), labels)?;

        Ok(images
            .add(grad.sign().mul_scalar(self.epsilon))
            .clamp(self.clip_min, self.clip_max))
    }
}
