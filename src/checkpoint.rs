use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use burn::{prelude::*, record::DefaultRecorder};

/// Extension [DefaultRecorder] appends to its files.
const EXTENSION: &str = "mpk";

/// A single weights file that is overwritten after every epoch.
///
/// Writes go to a staging file in the same directory which is then renamed over the
/// checkpoint, so an interrupted save never leaves a truncated file behind.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    path: PathBuf,
    staging: PathBuf,
    recorder: DefaultRecorder,
}

impl Checkpointer {
    pub fn new(dir: impl AsRef<Path>, name: &str) -> Self {
        let dir = dir.as_ref();

        Self {
            path: dir.join(format!("{name}.{EXTENSION}")),
            staging: dir.join(format!("{name}.partial.{EXTENSION}")),
            recorder: DefaultRecorder::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load<B: Backend, M: Module<B>>(&self, model: M, device: &B::Device) -> Result<M> {
        model
            .load_file(self.path.clone(), &self.recorder, device)
            .map_err(|err| anyhow!("{err:?}"))
            .with_context(|| format!("failed to load checkpoint '{}'", self.path.display()))
    }

    pub fn save<B: Backend, M: Module<B>>(&self, model: &M) -> Result<()> {
        model
            .clone()
            .save_file(self.staging.clone(), &self.recorder)
            .map_err(|err| anyhow!("{err:?}"))
            .with_context(|| format!("failed to write '{}'", self.staging.display()))?;

        fs::rename(&self.staging, &self.path).with_context(|| {
            format!(
                "failed to move '{}' to '{}'",
                self.staging.display(),
                self.path.display()
            )
        })?;

        tracing::debug!("checkpoint written to '{}'", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resnet::tests::tiny_config;
    use burn::{backend::NdArray, tensor::Distribution};
    use tempfile::TempDir;

    type TestBackend = NdArray;

    #[test]
    fn missing_file_is_reported_absent() {
        let dir = TempDir::new().unwrap();
        let checkpointer = Checkpointer::new(dir.path(), "weights");

        assert!(!checkpointer.exists());
        assert!(
            checkpointer
                .load(tiny_config().init::<TestBackend>(&Default::default()), &Default::default())
                .is_err()
        );
    }

    #[test]
    fn save_then_load_restores_weights() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let checkpointer = Checkpointer::new(dir.path(), "weights");

        TestBackend::seed(11);
        let trained = tiny_config().init::<TestBackend>(&device);
        checkpointer.save(&trained).unwrap();

        TestBackend::seed(12);
        let fresh = tiny_config().init::<TestBackend>(&device);
        let restored = checkpointer.load(fresh, &device).unwrap();

        let images = Tensor::<TestBackend, 4>::random([2, 1, 28, 28], Distribution::Default, &device);
        let diff = (trained.forward(images.clone()) - restored.forward(images))
            .abs()
            .max()
            .into_scalar();

        assert!(checkpointer.exists());
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn save_leaves_only_the_checkpoint_file() {
        let dir = TempDir::new().unwrap();
        let checkpointer = Checkpointer::new(dir.path(), "weights");
        let model = tiny_config().init::<TestBackend>(&Default::default());

        checkpointer.save(&model).unwrap();
        checkpointer.save(&model).unwrap();

        let mut files: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        files.sort();

        assert_eq!(files, vec!["weights.mpk".to_string()]);
        assert_eq!(checkpointer.path(), dir.path().join("weights.mpk"));
    }
}
