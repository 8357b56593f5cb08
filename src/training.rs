use std::sync::Arc;

use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::AutodiffModule,
    optim::{AdaGradConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    data::{Polarity, ReviewBatcher, ReviewDataset},
    embedding::{EmbeddingConfig, EmbeddingRegistry, Vocabulary},
    error::ExperimentError,
    model::{Model, ModelConfig},
    sweep::ExperimentRunner,
};

#[derive(Config)]
pub struct ExperimentConfig {
    pub model: ModelConfig,

    pub optimizer: AdaGradConfig,

    pub embedding: EmbeddingConfig,

    /// Optimizer updates; the training table is cycled as often as needed.
    #[config(default = 1000)]
    pub step_count: usize,

    #[config(default = 128)]
    pub batch_size: usize,

    #[config(default = 3.0e-3)]
    pub learning_rate: f64,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 4)]
    pub worker_count: usize,

    #[config(default = 256)]
    pub max_tokens: usize,

    #[config(default = 100)]
    pub log_interval: usize,
}

/// Accuracy of one classifier on the training and test tables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    #[serde(rename = "Training accuracy")]
    pub training_accuracy: f64,

    #[serde(rename = "Test accuracy")]
    pub test_accuracy: f64,
}

/// True and predicted labels collected batch by batch, so the pairs stay
/// aligned whatever order the loader workers deliver them in.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub targets: Vec<Polarity>,
    pub predictions: Vec<Polarity>,
}

impl Evaluation {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn accuracy(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }

        let correct = self
            .targets
            .iter()
            .zip(&self.predictions)
            .filter(|(target, prediction)| target == prediction)
            .count();

        correct as f64 / self.len() as f64
    }
}

pub struct TrainedClassifier<B: AutodiffBackend> {
    pub model: Model<B::InnerBackend>,
    pub train: Evaluation,
    pub test: Evaluation,
}

impl<B: AutodiffBackend> TrainedClassifier<B> {
    pub fn result(&self) -> ExperimentResult {
        ExperimentResult {
            training_accuracy: self.train.accuracy(),
            test_accuracy: self.test.accuracy(),
        }
    }
}

/// Trains a classifier on top of the embedding named by `source` and scores
/// it on both tables.
#[instrument(skip(train, test, config, registry, device))]
pub fn train_and_evaluate<B: AutodiffBackend>(
    source: &str,
    train_module: bool,
    train: Arc<ReviewDataset>,
    test: Arc<ReviewDataset>,
    config: &ExperimentConfig,
    registry: &EmbeddingRegistry,
    device: &B::Device,
) -> Result<TrainedClassifier<B>, ExperimentError> {
    if train.is_empty() {
        return Err(ExperimentError::EmptyDataset("train"));
    }
    if test.is_empty() {
        return Err(ExperimentError::EmptyDataset("test"));
    }

    let embedding = registry.resolve(source)?;

    B::seed(config.seed);

    let model = config
        .model
        .init::<B>(embedding.init::<B>(train_module, device), device);
    info!(
        params = model.num_params(),
        dim = embedding.dim,
        pretrained = embedding.is_pretrained(),
        "training classifier"
    );

    let model = fit(model, embedding.vocabulary.clone(), train.clone(), config, device).valid();

    let train = evaluate(&model, embedding.vocabulary.clone(), train, config, device);
    let test = evaluate(&model, embedding.vocabulary.clone(), test, config, device);

    let trained = TrainedClassifier {
        model,
        train,
        test,
    };
    let result = trained.result();
    info!(
        training_accuracy = result.training_accuracy,
        test_accuracy = result.test_accuracy,
        "experiment finished"
    );

    Ok(trained)
}

fn fit<B: AutodiffBackend>(
    mut model: Model<B>,
    vocabulary: Arc<Vocabulary>,
    train: Arc<ReviewDataset>,
    config: &ExperimentConfig,
    device: &B::Device,
) -> Model<B> {
    let batcher = ReviewBatcher::<B>::new(device.clone(), vocabulary, config.max_tokens);
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.worker_count)
        .build(train);

    let mut optimizer = config.optimizer.init();
    let mut step = 0;

    // Each pass over the loader reshuffles the table.
    while step < config.step_count {
        for batch in dataloader.iter() {
            let output = model.forward_classification(batch);

            if config.log_interval > 0 && (step + 1) % config.log_interval == 0 {
                let loss = output.loss.clone().into_scalar().elem::<f64>();
                info!(step = step + 1, loss, "training");
            }

            let grads = GradientsParams::from_grads(output.loss.backward(), &model);
            model = optimizer.step(config.learning_rate, model, grads);

            step += 1;
            if step == config.step_count {
                break;
            }
        }
        debug!(step, "finished pass over training table");
    }

    model
}

/// Scores `dataset` without shuffling or updating the model.
pub fn evaluate<B: Backend>(
    model: &Model<B>,
    vocabulary: Arc<Vocabulary>,
    dataset: Arc<ReviewDataset>,
    config: &ExperimentConfig,
    device: &B::Device,
) -> Evaluation {
    let batcher = ReviewBatcher::<B>::new(device.clone(), vocabulary, config.max_tokens);
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(config.batch_size)
        .num_workers(config.worker_count)
        .build(dataset);

    let to_polarity = |id: i64| Polarity::from_class_id(id as usize);

    let mut evaluation = Evaluation::default();
    for batch in dataloader.iter() {
        let predictions = model
            .forward(batch.tokens, batch.mask)
            .argmax(1)
            .flatten::<1>(0, 1);

        let targets = batch.targets.into_data().iter::<i64>().collect::<Vec<_>>();
        let predictions = predictions.into_data().iter::<i64>().collect::<Vec<_>>();

        // The output layer has one logit per polarity, so both ids always map.
        for (target, prediction) in targets.into_iter().zip(predictions) {
            if let (Some(target), Some(prediction)) = (to_polarity(target), to_polarity(prediction)) {
                evaluation.targets.push(target);
                evaluation.predictions.push(prediction);
            }
        }
    }

    evaluation
}

/// Runs experiments against a fixed pair of tables on one device.
pub struct ClassifierRunner<'a, B: AutodiffBackend> {
    pub config: &'a ExperimentConfig,
    pub registry: &'a EmbeddingRegistry,
    pub train: Arc<ReviewDataset>,
    pub test: Arc<ReviewDataset>,
    pub device: B::Device,
}

impl<B: AutodiffBackend> ClassifierRunner<'_, B> {
    pub fn train_and_evaluate(
        &self,
        source: &str,
        train_module: bool,
    ) -> Result<TrainedClassifier<B>, ExperimentError> {
        train_and_evaluate::<B>(
            source,
            train_module,
            self.train.clone(),
            self.test.clone(),
            self.config,
            self.registry,
            &self.device,
        )
    }
}

impl<B: AutodiffBackend> ExperimentRunner for ClassifierRunner<'_, B> {
    fn run(&mut self, source: &str, train_module: bool) -> Result<ExperimentResult, ExperimentError> {
        self.train_and_evaluate(source, train_module)
            .map(|trained| trained.result())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use burn::backend::{Autodiff, NdArray};
    use tempfile::TempDir;

    use super::*;
    use crate::data::Review;

    type B = Autodiff<NdArray<f32>>;

    const VECTORS: &str = "great 1.0 0.0 0.5\nwonderful 0.9 0.1 0.4\nbad -1.0 0.0 0.5\nawful -0.9 0.1 0.4\nfilm 0.0 1.0 0.0\n";

    fn vectors(dir: &Path) -> String {
        let path = dir.join("tiny.vec");
        fs::write(&path, VECTORS).unwrap();
        path.display().to_string()
    }

    fn reviews(count: usize) -> Arc<ReviewDataset> {
        let items = (0..count)
            .map(|i| {
                let (text, polarity) = if i % 2 == 0 {
                    ("great wonderful film", Polarity::Positive)
                } else {
                    ("bad awful film", Polarity::Negative)
                };
                Review {
                    text: text.to_string(),
                    raw_score: if polarity == Polarity::Positive { 9 } else { 2 },
                    polarity,
                }
            })
            .collect();
        Arc::new(ReviewDataset::from_reviews(items))
    }

    fn config() -> ExperimentConfig {
        ExperimentConfig::new(
            ModelConfig::new().with_hidden_units(vec![8, 4]),
            AdaGradConfig::new(),
            EmbeddingConfig::new().with_oov_buckets(4),
        )
        .with_step_count(20)
        .with_batch_size(4)
        .with_learning_rate(0.1)
        .with_worker_count(1)
        .with_log_interval(5)
    }

    fn weight_head(trained: &TrainedClassifier<B>) -> Vec<f32> {
        trained
            .model
            .embedding()
            .weights()
            .slice([0..5, 0..3])
            .into_data()
            .iter::<f32>()
            .collect()
    }

    fn file_values() -> Vec<f32> {
        VECTORS
            .split_whitespace()
            .filter_map(|field| field.parse::<f32>().ok())
            .collect()
    }

    #[test]
    fn evaluation_accuracy_counts_matches() {
        let evaluation = Evaluation {
            targets: vec![Polarity::Positive, Polarity::Negative, Polarity::Negative, Polarity::Positive],
            predictions: vec![Polarity::Positive, Polarity::Positive, Polarity::Negative, Polarity::Positive],
        };
        assert!((evaluation.accuracy() - 0.75).abs() < 1e-12);
        assert_eq!(Evaluation::default().accuracy(), 0.0);
    }

    #[test]
    fn trains_and_scores_both_tables() {
        let dir = TempDir::new().unwrap();
        let registry = EmbeddingRegistry::new(dir.path(), config().embedding.clone());

        let trained = train_and_evaluate::<B>(
            &vectors(dir.path()),
            false,
            reviews(10),
            reviews(6),
            &config(),
            &registry,
            &Default::default(),
        )
        .unwrap();

        assert_eq!(trained.train.len(), 10);
        assert_eq!(trained.test.len(), 6);

        let result = trained.result();
        assert!((0.0..=1.0).contains(&result.training_accuracy));
        assert!((0.0..=1.0).contains(&result.test_accuracy));
    }

    #[test]
    fn frozen_embedding_keeps_pretrained_weights() {
        let dir = TempDir::new().unwrap();
        let registry = EmbeddingRegistry::new(dir.path(), config().embedding.clone());
        let source = vectors(dir.path());

        let frozen = train_and_evaluate::<B>(
            &source,
            false,
            reviews(8),
            reviews(4),
            &config(),
            &registry,
            &Default::default(),
        )
        .unwrap();
        assert_eq!(weight_head(&frozen), file_values());

        let tuned = train_and_evaluate::<B>(
            &source,
            true,
            reviews(8),
            reviews(4),
            &config(),
            &registry,
            &Default::default(),
        )
        .unwrap();
        let moved = weight_head(&tuned)
            .iter()
            .zip(file_values())
            .any(|(after, before)| (after - before).abs() > 1e-6);
        assert!(moved, "fine-tuned embedding should change");
    }

    #[test]
    fn empty_tables_are_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = EmbeddingRegistry::new(dir.path(), config().embedding.clone());

        let result = train_and_evaluate::<B>(
            &vectors(dir.path()),
            false,
            Arc::new(ReviewDataset::from_reviews(vec![])),
            reviews(4),
            &config(),
            &registry,
            &Default::default(),
        );
        assert!(matches!(result, Err(ExperimentError::EmptyDataset("train"))));
    }

    #[test]
    fn unresolvable_embedding_is_fatal() {
        let dir = TempDir::new().unwrap();
        let registry = EmbeddingRegistry::new(dir.path(), config().embedding.clone());

        let result = train_and_evaluate::<B>(
            "random:",
            false,
            reviews(4),
            reviews(4),
            &config(),
            &registry,
            &Default::default(),
        );
        assert!(matches!(result, Err(ExperimentError::Embedding(_))));
    }
}
