use burn::{
    nn::{
        BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
    train::ClassificationOutput,
};

use crate::data::MnistBatch;

const BATCH_NORM_EPSILON: f64 = 1e-5;

/// Where batch-norm layers take their statistics from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NormMode {
    /// Batch statistics under autodiff, running statistics otherwise.
    Backend,
    /// Always running statistics, never updated.
    Frozen,
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    activation: Relu,
    maxpool: MaxPool2d,

    layer1: ResNetLayer<B>,
    layer2: ResNetLayer<B>,
    layer3: ResNetLayer<B>,
    layer4: ResNetLayer<B>,
    avgpool: AdaptiveAvgPool2d,
    fc: Linear<B>,
}

impl<B: Backend> ResNet<B> {
    /// # Shapes
    ///
    /// - input: `[batch_size, channels, height, width]`
    /// - output: `[batch_size, num_classes]` (logits)
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward_with(x, NormMode::Backend)
    }

    /// Evaluation-mode forward pass usable on an autodiff backend.
    ///
    /// Gradients still flow to the input, but batch norm uses (and leaves untouched)
    /// the running statistics.
    pub fn forward_frozen(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward_with(x, NormMode::Frozen)
    }

    fn forward_with(&self, x: Tensor<B, 4>, mode: NormMode) -> Tensor<B, 2> {
        let x = self.conv1.forward(x);
        let x = normalize(&self.bn1, x, mode);
        let x = self.activation.forward(x);
        let x = self.maxpool.forward(x);

        let x = self.layer1.forward(x, mode);
        let x = self.layer2.forward(x, mode);
        let x = self.layer3.forward(x, mode);
        let x = self.layer4.forward(x, mode);

        // MNIST already reaches a 1x1 map here, so the pool is the identity for it.
        let x = self.avgpool.forward(x);
        let x = x.flatten(1, 3);

        self.fc.forward(x)
    }

    pub fn forward_classification(&self, batch: MnistBatch<B>) -> ClassificationOutput<B> {
        let targets = batch.targets;
        let images = batch.images.detach();

        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

fn normalize<B: Backend>(bn: &BatchNorm<B, 2>, x: Tensor<B, 4>, mode: NormMode) -> Tensor<B, 4> {
    match mode {
        NormMode::Backend => bn.forward(x),
        NormMode::Frozen => {
            let channels = x.dims()[1];
            let shape = [1, channels, 1, 1];
            let device = x.device();

            let mean = bn.running_mean.value_sync().to_device(&device).reshape(shape);
            let std = bn
                .running_var
                .value_sync()
                .to_device(&device)
                .add_scalar(BATCH_NORM_EPSILON)
                .sqrt()
                .reshape(shape);

            x.sub(mean)
                .div(std)
                .mul(bn.gamma.val().reshape(shape))
                .add(bn.beta.val().reshape(shape))
        }
    }
}

#[derive(Config, Debug)]
pub struct ResNetConfig {
    num_classes: usize,
    input_channels: usize,
    /// Basic blocks per stage.
    #[config(default = "[3, 4, 6, 3]")]
    layers: [usize; 4],
    /// Channels of the stem and first stage; each later stage doubles it.
    #[config(default = 64)]
    base_planes: usize,
}

impl ResNetConfig {
    pub fn resnet34(num_classes: usize, input_channels: usize) -> Self {
        Self::new(num_classes, input_channels).with_layers([3, 4, 6, 3])
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        let planes = self.base_planes;

        ResNet {
            conv1: Conv2dConfig::new([self.input_channels, planes], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .with_initializer(he_normal())
                .init(device),
            bn1: batch_norm(planes, device),
            activation: Relu::new(),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),

            layer1: ResNetLayerConfig::new(planes, planes, [1, 1], self.layers[0]).init(device),
            layer2: ResNetLayerConfig::new(planes, planes * 2, [2, 2], self.layers[1])
                .init(device),
            layer3: ResNetLayerConfig::new(planes * 2, planes * 4, [2, 2], self.layers[2])
                .init(device),
            layer4: ResNetLayerConfig::new(planes * 4, planes * 8, [2, 2], self.layers[3])
                .init(device),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(planes * 8, self.num_classes).init(device),
        }
    }
}

/// `N(0, 2 / (k * k * out_channels))`
fn he_normal() -> Initializer {
    Initializer::KaimingNormal {
        gain: 2.0_f64.sqrt(),
        fan_out_only: true,
    }
}

fn batch_norm<B: Backend>(channels: usize, device: &B::Device) -> BatchNorm<B, 2> {
    BatchNormConfig::new(channels)
        .with_epsilon(BATCH_NORM_EPSILON)
        .init(device)
}

#[derive(Module, Debug)]
struct ResNetLayer<B: Backend> {
    blocks: Vec<BasicBlock<B>>,
}

impl<B: Backend> ResNetLayer<B> {
    fn forward(&self, x: Tensor<B, 4>, mode: NormMode) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(x, |x, block| block.forward(x, mode))
    }
}

#[derive(Config, Debug)]
struct ResNetLayerConfig {
    in_planes: usize,
    out_planes: usize,
    stride: [usize; 2],
    num_blocks: usize,
}

impl ResNetLayerConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> ResNetLayer<B> {
        let downsample = if self.stride != [1, 1] || self.in_planes != self.out_planes {
            Some(DownSampleConfig::new(
                self.in_planes,
                self.out_planes,
                self.stride,
            ))
        } else {
            None
        };

        let mut blocks = Vec::with_capacity(self.num_blocks);
        blocks.push(
            BasicBlockConfig::new(self.in_planes, self.out_planes)
                .with_stride(self.stride)
                .with_downsample(downsample)
                .init(device),
        );
        for _ in 1..self.num_blocks {
            blocks.push(BasicBlockConfig::new(self.out_planes, self.out_planes).init(device));
        }

        ResNetLayer { blocks }
    }
}

#[derive(Module, Debug)]
struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    shortcut: Option<DownSample<B>>,
    activation: Relu,
}

impl<B: Backend> BasicBlock<B> {
    fn forward(&self, x: Tensor<B, 4>, mode: NormMode) -> Tensor<B, 4> {
        let shortcut = match &self.shortcut {
            Some(shortcut) => shortcut.forward(x.clone(), mode),
            None => x.clone(),
        };

        let x = self.conv1.forward(x);
        let x = normalize(&self.bn1, x, mode);
        let x = self.activation.forward(x);

        let x = self.conv2.forward(x);
        let x = normalize(&self.bn2, x, mode);

        debug_assert_eq!(
            x.dims(),
            shortcut.dims(),
            "BasicBlock: shape mismatch between main path and shortcut"
        );

        self.activation.forward(x + shortcut)
    }
}

#[derive(Config, Debug)]
struct BasicBlockConfig {
    in_planes: usize,
    out_planes: usize,
    #[config(default = "[1, 1]")]
    stride: [usize; 2],
    #[config(default = "None")]
    downsample: Option<DownSampleConfig>,
}

impl BasicBlockConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> BasicBlock<B> {
        BasicBlock {
            conv1: conv3x3(self.in_planes, self.out_planes, self.stride, device),
            bn1: batch_norm(self.out_planes, device),
            conv2: conv3x3(self.out_planes, self.out_planes, [1, 1], device),
            bn2: batch_norm(self.out_planes, device),
            shortcut: self.downsample.as_ref().map(|ds| ds.init(device)),
            activation: Relu::new(),
        }
    }
}

fn conv3x3<B: Backend>(
    in_planes: usize,
    out_planes: usize,
    stride: [usize; 2],
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_planes, out_planes], [3, 3])
        .with_stride(stride)
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .with_initializer(he_normal())
        .init(device)
}

/// 1x1 projection shortcut.
#[derive(Module, Debug)]
struct DownSample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> DownSample<B> {
    fn forward(&self, x: Tensor<B, 4>, mode: NormMode) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        normalize(&self.bn, x, mode)
    }
}

#[derive(Config, Debug)]
struct DownSampleConfig {
    in_planes: usize,
    out_planes: usize,
    stride: [usize; 2],
}

impl DownSampleConfig {
    fn init<B: Backend>(&self, device: &B::Device) -> DownSample<B> {
        DownSample {
            conv: Conv2dConfig::new([self.in_planes, self.out_planes], [1, 1])
                .with_stride(self.stride)
                .with_bias(false)
                .with_initializer(he_normal())
                .init(device),
            bn: batch_norm(self.out_planes, device),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::{
        backend::{Autodiff, NdArray},
        module::AutodiffModule,
        tensor::Distribution,
    };

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    /// One block per stage, narrow channels.
    pub(crate) fn tiny_config() -> ResNetConfig {
        ResNetConfig::new(10, 1)
            .with_layers([1, 1, 1, 1])
            .with_base_planes(4)
    }

    /// Weights of the final fully connected layer.
    pub(crate) fn classifier_weights<B: Backend>(model: &ResNet<B>) -> Tensor<B, 2> {
        model.fc.weight.val()
    }

    fn max_abs_diff<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> f32 {
        (a - b).abs().max().into_scalar().elem::<f32>()
    }

    #[test]
    fn resnet34_stage_depths() {
        let config = ResNetConfig::resnet34(10, 1).with_base_planes(2);
        let model = config.init::<TestBackend>(&Default::default());

        let depths = [
            model.layer1.blocks.len(),
            model.layer2.blocks.len(),
            model.layer3.blocks.len(),
            model.layer4.blocks.len(),
        ];
        assert_eq!(depths, [3, 4, 6, 3]);
    }

    #[test]
    fn only_first_block_of_a_resized_stage_projects() {
        let model = ResNetConfig::resnet34(10, 1)
            .with_base_planes(2)
            .init::<TestBackend>(&Default::default());

        assert!(model.layer1.blocks.iter().all(|b| b.shortcut.is_none()));
        for layer in [&model.layer2, &model.layer3, &model.layer4] {
            assert!(layer.blocks[0].shortcut.is_some());
            assert!(layer.blocks[1..].iter().all(|b| b.shortcut.is_none()));
        }
    }

    #[test]
    fn mnist_input_yields_logits_per_class() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random([3, 1, 28, 28], Distribution::Default, &device);

        assert_eq!(model.forward(images).dims(), [3, 10]);
    }

    #[test]
    fn frozen_forward_matches_inference_forward() {
        let device = Default::default();
        let model = tiny_config().init::<TestAutodiffBackend>(&device);
        let images =
            Tensor::<TestBackend, 4>::random([2, 1, 28, 28], Distribution::Default, &device);

        // Move the running statistics away from their (0, 1) initial values.
        let warmup = Tensor::<TestAutodiffBackend, 4>::random(
            [4, 1, 28, 28],
            Distribution::Uniform(0.0, 3.0),
            &device,
        );
        let _ = model.forward(warmup);

        let frozen = model.forward_frozen(Tensor::from_inner(images.clone())).inner();
        let inference = model.valid().forward(images);

        assert!(max_abs_diff(frozen, inference) < 1e-4);
    }

    #[test]
    fn frozen_forward_leaves_running_stats_untouched() {
        let device = Default::default();
        let model = tiny_config().init::<TestAutodiffBackend>(&device);
        let before = model.bn1.running_mean.value_sync().inner();

        let images = Tensor::<TestAutodiffBackend, 4>::random(
            [2, 1, 28, 28],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let _ = model.forward_frozen(images);

        let after = model.bn1.running_mean.value_sync().inner();
        let diff = (after - before).abs().max().into_scalar().elem::<f32>();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn classification_output_carries_loss() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let batch = MnistBatch {
            images: Tensor::random([2, 1, 28, 28], Distribution::Default, &device),
            targets: Tensor::from_data(TensorData::from([1i64, 4]), &device),
        };

        let output = model.forward_classification(batch);
        let loss = output.loss.into_scalar().elem::<f32>();

        assert_eq!(output.output.dims(), [2, 10]);
        assert!(loss.is_finite() && loss > 0.0);
    }
}
