use std::{
    fmt,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use burn::{prelude::*, tensor::Int};
use serde::{Deserialize, Serialize};

/// Number of rows whose argmax matches the target class.
pub fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let predictions = logits.argmax(1).flatten::<1>(0, 1);

    predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accuracy {
    pub correct: usize,
    pub total: usize,
}

impl Accuracy {
    pub fn record(&mut self, correct: usize, total: usize) {
        self.correct += correct;
        self.total += total;
    }

    /// Fraction in `[0, 1]`; an empty tally counts as zero.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64
    }

    pub fn percent(&self) -> f64 {
        self.ratio() * 100.0
    }
}

impl fmt::Display for Accuracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}%", self.percent())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub mean_loss: f64,
    pub accuracy: Accuracy,
}

/// Appends one row per epoch to a CSV file.
///
/// The header is only written when the file is created, so resumed runs keep
/// extending the same log.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    const HEADER: &'static str = "epoch,mean_loss,correct,total,accuracy";

    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("cannot create '{}'", dir.display()))?;

        let csv_path = dir.join("metrics.csv");
        if !csv_path.exists() {
            let mut file = fs::File::create(&csv_path)
                .with_context(|| format!("cannot create '{}'", csv_path.display()))?;
            writeln!(file, "{}", Self::HEADER)?;
        }

        Ok(Self { csv_path })
    }

    pub fn log(&self, metrics: &EpochMetrics) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("cannot open '{}'", self.csv_path.display()))?;

        writeln!(
            file,
            "{},{:.6},{},{},{:.6}",
            metrics.epoch,
            metrics.mean_loss,
            metrics.accuracy.correct,
            metrics.accuracy.total,
            metrics.accuracy.ratio(),
        )?;

        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

/// Accuracy of the trained model under one attack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackOutcome {
    pub attack: String,
    pub accuracy: Accuracy,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub clean: Accuracy,
    pub fgsm: AttackOutcome,
    pub pgd: AttackOutcome,
}

impl ExperimentReport {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;

        fs::write(path, json).with_context(|| format!("cannot write report to '{}'", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    #[test]
    fn counts_argmax_hits() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats(
            [[0.1, 2.0, 0.3], [5.0, 0.0, 1.0], [0.0, 0.2, 0.1]],
            &device,
        );
        let targets = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([1i64, 0, 2]), &device);

        assert_eq!(count_correct(logits, targets), 2);
    }

    #[test]
    fn accuracy_accumulates_over_batches() {
        let mut accuracy = Accuracy::default();
        accuracy.record(120, 128);
        accuracy.record(8, 16);

        assert_eq!(accuracy, Accuracy { correct: 128, total: 144 });
        assert_eq!(accuracy.to_string(), "88.89%");
    }

    #[test]
    fn empty_accuracy_is_zero() {
        assert_eq!(Accuracy::default().ratio(), 0.0);
    }

    #[test]
    fn csv_header_is_written_once() {
        let dir = TempDir::new().unwrap();

        let row = EpochMetrics {
            epoch: 1,
            mean_loss: 0.25,
            accuracy: Accuracy { correct: 3, total: 4 },
        };
        MetricsLogger::new(dir.path()).unwrap().log(&row).unwrap();
        let logger = MetricsLogger::new(dir.path()).unwrap();
        logger.log(&EpochMetrics { epoch: 2, ..row }).unwrap();

        let content = fs::read_to_string(logger.csv_path()).unwrap();
        let lines: Vec<_> = content.lines().collect();

        assert_eq!(
            lines,
            vec![
                MetricsLogger::HEADER,
                "1,0.250000,3,4,0.750000",
                "2,0.250000,3,4,0.750000",
            ]
        );
    }

    #[test]
    fn report_serializes_all_phases() {
        let outcome = |attack: &str| AttackOutcome {
            attack: attack.to_string(),
            accuracy: Accuracy { correct: 1, total: 2 },
            elapsed_secs: 1.5,
        };
        let report = ExperimentReport {
            clean: Accuracy { correct: 2, total: 2 },
            fgsm: outcome("FGSM"),
            pgd: outcome("PGD"),
        };

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["clean"]["correct"], 2);
        assert_eq!(value["pgd"]["attack"], "PGD");
        assert_eq!(value["fgsm"]["elapsed_secs"], 1.5);
    }
}
