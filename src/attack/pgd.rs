use anyhow::{Result, ensure};
use burn::{
    prelude::*,
    tensor::{Int, backend::AutodiffBackend},
};

use super::{Attack, check_clip_range, loss_gradient};
use crate::resnet::ResNet;

#[derive(Config, Debug)]
pub struct PgdConfig {
    /// Radius of the L∞ ball around the clean input.
    #[config(default = 0.1)]
    pub epsilon: f64,
    #[config(default = 0.1)]
    pub step_size: f64,
    #[config(default = 40)]
    pub max_iter: usize,
    #[config(default = 0.0)]
    pub clip_min: f64,
    #[config(default = 1.0)]
    pub clip_max: f64,
}

impl PgdConfig {
    pub fn init(&self) -> Result<Pgd> {
        ensure!(
            self.epsilon >= 0.0,
            "epsilon must be non-negative, got {}",
            self.epsilon
        );
        ensure!(
            self.step_size > 0.0,
            "step size must be positive, got {}",
            self.step_size
        );
        check_clip_range(self.clip_min, self.clip_max)?;

        Ok(Pgd {
            epsilon: self.epsilon,
            step_size: self.step_size,
            max_iter: self.max_iter,
            clip_min: self.clip_min,
            clip_max: self.clip_max,
        })
    }
}

/// Projected Gradient Descent, starting from the clean input (no random restart).
#[derive(Debug, Clone)]
pub struct Pgd {
    epsilon: f64,
    step_size: f64,
    max_iter: usize,
    clip_min: f64,
    clip_max: f64,
}

impl Pgd {
    fn project<B: Backend>(&self, adv: Tensor<B, 4>, origin: Tensor<B, 4>) -> Tensor<B, 4> {
        let delta = adv
            .sub(origin.clone())
            .clamp(-self.epsilon, self.epsilon);

        origin.add(delta)
    }
}

impl<B: AutodiffBackend> Attack<B> for Pgd {
    fn name(&self) -> &'static str {
        "PGD"
    }

    fn generate(
        &self,
        model: &ResNet<B>,
        images: Tensor<B::InnerBackend, 4>,
        labels: Tensor<B::InnerBackend, 1, Int>,
    ) -> Result<Tensor<B::InnerBackend, 4>> {
        let mut adv = images.clone();

        for _ in 0..self.max_iter {
            let grad = loss_gradient(model, adv.clone(), labels.clone())?;
            let stepped = adv
                .add(grad.sign().mul_scalar(self.step_size))
                .clamp(self.clip_min, self.clip_max);

            adv = self.project(stepped, images.clone());
        }

        Ok(adv)
    }
}
