//! Sequential comparison of embedding sources and trainability.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    embedding::EmbeddingSource,
    error::{EmbeddingError, ExperimentError},
    training::ExperimentResult,
};

/// Something that can train and score one classifier configuration.
pub trait ExperimentRunner {
    fn run(&mut self, source: &str, train_module: bool) -> Result<ExperimentResult, ExperimentError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepEntry {
    pub label: String,
    pub source: String,
    pub train_module: bool,
}

impl SweepEntry {
    pub fn new(label: impl Into<String>, source: impl Into<String>, train_module: bool) -> Self {
        Self {
            label: label.into(),
            source: source.into(),
            train_module,
        }
    }

    /// The four combinations for `pretrained`: pretrained frozen, pretrained
    /// trainable, random frozen, random trainable, in that order.
    pub fn matrix(pretrained: &str) -> Result<Vec<SweepEntry>, EmbeddingError> {
        let pretrained: EmbeddingSource = pretrained.parse()?;
        if matches!(pretrained, EmbeddingSource::Random(_)) {
            return Err(EmbeddingError::InvalidIdentifier(pretrained.to_string()));
        }
        let random = EmbeddingSource::Random(Box::new(pretrained.clone()));

        let mut entries = Vec::with_capacity(4);
        for source in [pretrained, random] {
            let name = source.name();
            let source = source.to_string();
            entries.push(SweepEntry::new(name.clone(), source.clone(), false));
            entries.push(SweepEntry::new(
                format!("{name}-with-module-training"),
                source,
                true,
            ));
        }

        Ok(entries)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRecord {
    pub label: String,

    #[serde(flatten)]
    pub result: ExperimentResult,
}

/// Results keyed by label, in sweep order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepResults {
    pub records: Vec<SweepRecord>,
}

impl SweepResults {
    pub fn get(&self, label: &str) -> Option<&ExperimentResult> {
        self.records
            .iter()
            .find(|record| record.label == label)
            .map(|record| &record.result)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|record| record.label.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Runs every entry one after the other. The first failure ends the sweep.
pub fn run_sweep<R: ExperimentRunner>(
    runner: &mut R,
    entries: &[SweepEntry],
) -> Result<SweepResults, ExperimentError> {
    let mut results = SweepResults::default();

    for (index, entry) in entries.iter().enumerate() {
        info!(
            experiment = %entry.label,
            progress = %format!("{}/{}", index + 1, entries.len()),
            "starting experiment"
        );

        let result = runner.run(&entry.source, entry.train_module)?;
        results.records.push(SweepRecord {
            label: entry.label.clone(),
            result,
        });
    }

    Ok(results)
}
