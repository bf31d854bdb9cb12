use std::sync::Arc;

use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder, batcher::Batcher},
        dataset::vision::{MnistDataset, MnistItem},
    },
    prelude::*,
    tensor::{Int, Tensor},
};

use crate::experiment::ExperimentConfig;

pub type MnistLoader<B> = Arc<dyn DataLoader<B, MnistBatch<B>>>;

#[derive(Debug, Clone, Default)]
pub struct MnistBatcher {}

#[derive(Debug, Clone)]
pub struct MnistBatch<B: Backend> {
    /// `[batch_size, 1, 28, 28]`, pixel values in `[0, 1]`.
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, MnistItem, MnistBatch<B>> for MnistBatcher {
    fn batch(&self, items: Vec<MnistItem>, device: &<B as Backend>::Device) -> MnistBatch<B> {
        let images = items
            .iter()
            .map(|item| TensorData::from(item.image))
            .map(|data| Tensor::<B, 2>::from_data(data.convert::<B::FloatElem>(), device))
            .map(|tensor| tensor.reshape([1, 1, 28, 28]))
            // Squeezing and the attacks both clip to (0, 1), so no mean/std shift here.
            .map(|tensor| tensor / 255)
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    TensorData::from([(item.label as i64).elem::<B::IntElem>()]),
                    device,
                )
            })
            .collect();

        let images = Tensor::cat(images, 0);
        let targets = Tensor::cat(targets, 0);

        MnistBatch { images, targets }
    }
}

pub fn train_loader<B: Backend>(config: &ExperimentConfig, device: &B::Device) -> MnistLoader<B> {
    DataLoaderBuilder::new(MnistBatcher::default())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(MnistDataset::train())
}

pub fn test_loader<B: Backend>(config: &ExperimentConfig, device: &B::Device) -> MnistLoader<B> {
    DataLoaderBuilder::new(MnistBatcher::default())
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(MnistDataset::test())
}

/// Number of batches a loader yields per pass.
pub fn num_batches<B: Backend>(loader: &MnistLoader<B>, batch_size: usize) -> usize {
    loader.num_items().div_ceil(batch_size)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::{backend::NdArray, data::dataset::InMemDataset};

    type TestBackend = NdArray;

    fn item(value: f32, label: u8) -> MnistItem {
        MnistItem {
            image: [[value; 28]; 28],
            label,
        }
    }

    /// Constant-grey digits cycling through the ten labels.
    pub(crate) fn synthetic_loader<B: Backend>(items: usize, batch_size: usize) -> MnistLoader<B> {
        let items: Vec<MnistItem> = (0..items)
            .map(|i| item((i * 25 % 256) as f32, (i % 10) as u8))
            .collect();

        DataLoaderBuilder::new(MnistBatcher::default())
            .batch_size(batch_size)
            .build(InMemDataset::new(items))
    }

    #[test]
    fn batch_has_channel_dim_and_unit_range() {
        let device = Default::default();
        let batch: MnistBatch<TestBackend> =
            MnistBatcher::default().batch(vec![item(255.0, 3), item(0.0, 7)], &device);

        assert_eq!(batch.images.dims(), [2, 1, 28, 28]);
        assert_eq!(batch.targets.dims(), [2]);

        let max = batch.images.clone().max().into_scalar().elem::<f32>();
        let min = batch.images.min().into_scalar().elem::<f32>();
        assert_eq!(max, 1.0);
        assert_eq!(min, 0.0);

        let labels = batch.targets.into_data().to_vec::<i64>().unwrap();
        assert_eq!(labels, vec![3, 7]);
    }

    #[test]
    fn mid_grey_is_scaled_linearly() {
        let device = Default::default();
        let batch: MnistBatch<TestBackend> =
            MnistBatcher::default().batch(vec![item(51.0, 0)], &device);

        let mean = batch.images.mean().into_scalar().elem::<f32>();
        assert!((mean - 0.2).abs() < 1e-6);
    }
}
