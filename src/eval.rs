use std::time::Instant;

use anyhow::Result;
use burn::{module::AutodiffModule, prelude::*, tensor::backend::AutodiffBackend};

use crate::{
    attack::{Attack, AttackLabels},
    data::MnistLoader,
    metrics::{Accuracy, AttackOutcome, count_correct},
    resnet::ResNet,
};

/// Accuracy of an evaluation-mode model on unmodified inputs.
pub fn clean_accuracy<B: Backend>(model: &ResNet<B>, loader: &MnistLoader<B>) -> Accuracy {
    let mut accuracy = Accuracy::default();

    for batch in loader.iter() {
        let total = batch.targets.dims()[0];
        let logits = model.forward(batch.images);
        accuracy.record(count_correct(logits, batch.targets), total);
    }

    accuracy
}

/// Accuracy on adversarial versions of every test batch, plus the wall-clock time spent
/// generating and classifying them.
pub fn adversarial_accuracy<B, A>(
    model: &ResNet<B>,
    attack: &A,
    labels: AttackLabels,
    loader: &MnistLoader<B::InnerBackend>,
) -> Result<AttackOutcome>
where
    B: AutodiffBackend,
    A: Attack<B>,
{
    let model_valid = model.valid();
    let mut accuracy = Accuracy::default();
    let start = Instant::now();

    for batch in loader.iter() {
        let total = batch.targets.dims()[0];
        let attacked = match labels {
            AttackLabels::True => batch.targets.clone(),
            AttackLabels::Predicted => model_valid
                .forward(batch.images.clone())
                .argmax(1)
                .flatten::<1>(0, 1),
        };

        let adversarial = attack.generate(model, batch.images, attacked)?;
        let logits = model_valid.forward(adversarial);
        accuracy.record(count_correct(logits, batch.targets), total);
    }

    let elapsed = start.elapsed();
    tracing::debug!("{} finished in {:?}", attack.name(), elapsed);

    Ok(AttackOutcome {
        attack: attack.name().to_string(),
        accuracy,
        elapsed_secs: elapsed.as_secs_f64(),
    })
}
