//! Gradient-based evasion attacks against a trained [ResNet](crate::resnet::ResNet).
//!
//! Both attacks are untargeted L∞ attacks. Gradients are taken through the
//! evaluation-mode network ([ResNet::forward_frozen]) so that batch norm behaves as it
//! does at test time and its running statistics are not disturbed.

mod fgsm;
mod pgd;

pub use fgsm::*;
pub use pgd::*;

use anyhow::{Context, Result, ensure};
use burn::{
    nn::loss::CrossEntropyLossConfig,
    prelude::*,
    tensor::{Int, backend::AutodiffBackend},
};
use serde::{Deserialize, Serialize};

use crate::resnet::ResNet;

/// Labels the attack pushes the model away from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttackLabels {
    /// The model's own predictions on the clean batch.
    ///
    /// Avoids the label-leaking effect of attacking with ground truth.
    Predicted,
    /// Ground-truth labels from the dataset.
    True,
}

pub trait Attack<B: AutodiffBackend> {
    fn name(&self) -> &'static str;

    /// Returns adversarial versions of `images`, same shape, inside the clip range.
    fn generate(
        &self,
        model: &ResNet<B>,
        images: Tensor<B::InnerBackend, 4>,
        labels: Tensor<B::InnerBackend, 1, Int>,
    ) -> Result<Tensor<B::InnerBackend, 4>>;
}

/// Gradient of the mean cross-entropy loss with respect to the input images.
pub fn loss_gradient<B: AutodiffBackend>(
    model: &ResNet<B>,
    images: Tensor<B::InnerBackend, 4>,
    labels: Tensor<B::InnerBackend, 1, Int>,
) -> Result<Tensor<B::InnerBackend, 4>> {
    let images = Tensor::<B, 4>::from_inner(images).require_grad();
    let logits = model.forward_frozen(images.clone());

    let loss = CrossEntropyLossConfig::new()
        .init(&logits.device())
        .forward(logits, Tensor::from_inner(labels));
    let grads = loss.backward();

    images
        .grad(&grads)
        .context("input images are missing from the autodiff graph")
}

fn check_clip_range(clip_min: f64, clip_max: f64) -> Result<()> {
    ensure!(
        clip_min < clip_max,
        "clip range must be increasing, got ({clip_min}, {clip_max})"
    );
    Ok(())
}
