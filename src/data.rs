use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
    },
    prelude::*,
};
use once_cell::sync::Lazy;
use rand::{rngs::StdRng, seq::SliceRandom, thread_rng, SeedableRng};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use regex::Regex;
use tracing::{debug, info};

use crate::{embedding::Vocabulary, error::DatasetError};

static FILE_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+_(\d+)\.txt$").expect("valid file name pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarity {
    Negative,
    Positive,
}

impl Polarity {
    /// Every label, in class id order.
    pub const ALL: [Polarity; 2] = [Polarity::Negative, Polarity::Positive];

    pub fn class_id(self) -> usize {
        match self {
            Polarity::Negative => 0,
            Polarity::Positive => 1,
        }
    }

    /// `None` for ids outside `0..Polarity::ALL.len()`.
    pub fn from_class_id(id: usize) -> Option<Self> {
        Polarity::ALL.get(id).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub text: String,
    pub raw_score: u8,
    pub polarity: Polarity,
}

/// Extracts the reviewer score from a `<id>_<score>.txt` file name.
pub fn parse_score(file_name: &str) -> Result<u8, DatasetError> {
    FILE_NAME_PATTERN
        .captures(file_name)
        .and_then(|captures| captures[1].parse().ok())
        .ok_or_else(|| DatasetError::FileName(file_name.to_string()))
}

fn read_review(path: PathBuf, polarity: Polarity) -> Result<Review, DatasetError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let raw_score = parse_score(&file_name)?;
    let text = fs::read_to_string(&path).map_err(|source| DatasetError::Io {
        path: path.clone(),
        source,
    })?;

    Ok(Review {
        text,
        raw_score,
        polarity,
    })
}

/// Reads every file of `dir` as a review. A single badly named entry fails the whole load.
pub fn load_directory(dir: &Path, polarity: Polarity) -> Result<Vec<Review>, DatasetError> {
    let io_error = |source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let paths = fs::read_dir(dir)
        .map_err(io_error)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error)?;

    let reviews = paths
        .into_par_iter()
        .map(|path| read_review(path, polarity))
        .collect::<Result<Vec<_>, _>>()?;

    debug!(dir = %dir.display(), count = reviews.len(), "loaded review directory");

    Ok(reviews)
}

pub struct ReviewDataset {
    pub dataset: InMemDataset<Review>,
}

impl Dataset<Review> for ReviewDataset {
    fn get(&self, index: usize) -> Option<Review> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl ReviewDataset {
    /// Merges positive and negative reviews and shuffles them. `None` leaves the order unseeded.
    pub fn from_directories(pos: &Path, neg: &Path, seed: Option<u64>) -> Result<Self, DatasetError> {
        let mut items = load_directory(pos, Polarity::Positive)?;
        items.extend(load_directory(neg, Polarity::Negative)?);

        match seed {
            Some(seed) => items.shuffle(&mut StdRng::seed_from_u64(seed)),
            None => items.shuffle(&mut thread_rng()),
        }

        Ok(Self::from_reviews(items))
    }

    /// Loads a `<split>/{pos,neg}` directory pair.
    pub fn load_split(split_dir: &Path, seed: Option<u64>) -> Result<Self, DatasetError> {
        let dataset = Self::from_directories(&split_dir.join("pos"), &split_dir.join("neg"), seed)?;

        let (negative, positive) = dataset.polarity_counts();
        info!(
            split = %split_dir.display(),
            positive,
            negative,
            "loaded review split"
        );

        Ok(dataset)
    }

    pub fn from_reviews(items: Vec<Review>) -> Self {
        Self {
            dataset: InMemDataset::new(items),
        }
    }

    /// Returns `(negative, positive)` record counts.
    pub fn polarity_counts(&self) -> (usize, usize) {
        self.iter().fold((0, 0), |(negative, positive), review| {
            match review.polarity {
                Polarity::Negative => (negative + 1, positive),
                Polarity::Positive => (negative, positive + 1),
            }
        })
    }
}

#[derive(Clone, Debug)]
pub struct ReviewBatch<B: Backend> {
    pub tokens: Tensor<B, 2, Int>,
    pub mask: Tensor<B, 2>,
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone)]
pub struct ReviewBatcher<B: Backend> {
    device: B::Device,
    vocabulary: Arc<Vocabulary>,
    max_tokens: usize,
}

impl<B: Backend> ReviewBatcher<B> {
    pub fn new(device: B::Device, vocabulary: Arc<Vocabulary>, max_tokens: usize) -> Self {
        Self {
            device,
            vocabulary,
            max_tokens,
        }
    }
}

impl<B: Backend> Batcher<Review, ReviewBatch<B>> for ReviewBatcher<B> {
    fn batch(&self, items: Vec<Review>) -> ReviewBatch<B> {
        let encoded: Vec<Vec<usize>> = items
            .iter()
            .map(|item| self.vocabulary.encode(&item.text, self.max_tokens))
            .collect();

        // Padding positions point at row 0 and are zeroed out by the mask.
        let seq_len = encoded.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let batch_size = items.len();

        let mut ids = vec![0i64; batch_size * seq_len];
        let mut mask = vec![0f32; batch_size * seq_len];
        for (row, tokens) in encoded.iter().enumerate() {
            for (col, &id) in tokens.iter().enumerate() {
                ids[row * seq_len + col] = id as i64;
                mask[row * seq_len + col] = 1.0;
            }
        }

        let targets: Vec<i64> = items
            .iter()
            .map(|item| item.polarity.class_id() as i64)
            .collect();

        let tokens = Tensor::<B, 2, Int>::from_data(
            TensorData::new(ids, [batch_size, seq_len]).convert::<B::IntElem>(),
            &self.device,
        );
        let mask = Tensor::<B, 2>::from_data(
            TensorData::new(mask, [batch_size, seq_len]).convert::<B::FloatElem>(),
            &self.device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(targets, [batch_size]).convert::<B::IntElem>(),
            &self.device,
        );

        ReviewBatch {
            tokens,
            mask,
            targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use burn::backend::NdArray;
    use tempfile::TempDir;

    use super::*;
    use crate::embedding::EmbeddingConfig;

    fn write_files<N: AsRef<str>, T: AsRef<str>>(dir: &Path, files: &[(N, T)]) {
        fs::create_dir_all(dir).unwrap();
        for (name, content) in files {
            fs::write(dir.join(name.as_ref()), content.as_ref()).unwrap();
        }
    }

    #[test]
    fn parses_score_between_underscore_and_extension() {
        assert_eq!(parse_score("0_3.txt").unwrap(), 3);
        assert_eq!(parse_score("12345_10.txt").unwrap(), 10);
        assert_eq!(parse_score("7_1.txt").unwrap(), 1);
    }

    #[test]
    fn rejects_malformed_file_names() {
        for name in ["readme.md", "1_a.txt", "_3.txt", "1_3.txt.bak", "1-3.txt", "1_300.txt"] {
            assert!(
                matches!(parse_score(name), Err(DatasetError::FileName(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn one_bad_file_fails_the_directory() {
        let dir = TempDir::new().unwrap();
        write_files(
            dir.path(),
            &[("1_9.txt", "great"), ("2_8.txt", "fine"), ("notes.txt", "oops")],
        );

        let result = load_directory(dir.path(), Polarity::Positive);
        assert!(matches!(result, Err(DatasetError::FileName(name)) if name == "notes.txt"));
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let result = load_directory(&dir.path().join("absent"), Polarity::Negative);
        assert!(matches!(result, Err(DatasetError::Io { .. })));
    }

    #[test]
    fn merges_two_reviews_with_polarity() {
        let root = TempDir::new().unwrap();
        write_files(&root.path().join("pos"), &[("1_9.txt", "great film")]);
        write_files(&root.path().join("neg"), &[("2_2.txt", "bad film")]);

        let dataset = ReviewDataset::load_split(root.path(), None).unwrap();
        assert_eq!(dataset.len(), 2);

        let reviews: Vec<_> = dataset.iter().collect();
        assert!(reviews.contains(&Review {
            text: "great film".to_string(),
            raw_score: 9,
            polarity: Polarity::Positive,
        }));
        assert!(reviews.contains(&Review {
            text: "bad film".to_string(),
            raw_score: 2,
            polarity: Polarity::Negative,
        }));
    }

    #[test]
    fn merge_keeps_every_record_and_labels_by_source() {
        let root = TempDir::new().unwrap();
        let pos: Vec<(String, String)> = (0..7)
            .map(|i| (format!("{i}_{}.txt", 7 + i % 4), format!("pos review {i}")))
            .collect();
        let neg: Vec<(String, String)> = (0..5)
            .map(|i| (format!("{i}_{}.txt", 1 + i % 4), format!("neg review {i}")))
            .collect();
        write_files(&root.path().join("pos"), &pos);
        write_files(&root.path().join("neg"), &neg);

        let dataset = ReviewDataset::load_split(root.path(), Some(3)).unwrap();
        assert_eq!(dataset.len(), 12);
        assert_eq!(dataset.polarity_counts(), (5, 7));

        let positives: HashSet<String> = pos.iter().map(|(_, text)| text.clone()).collect();
        for review in dataset.iter() {
            let expected = if positives.contains(&review.text) {
                Polarity::Positive
            } else {
                Polarity::Negative
            };
            assert_eq!(review.polarity, expected);
        }

        // Dense zero-based index.
        assert!((0..dataset.len()).all(|index| dataset.get(index).is_some()));
        assert!(dataset.get(dataset.len()).is_none());
    }

    #[test]
    fn same_seed_gives_same_order() {
        let root = TempDir::new().unwrap();
        let pos: Vec<(String, String)> = (0..20).map(|i| (format!("{i}_8.txt"), format!("p{i}"))).collect();
        let neg: Vec<(String, String)> = (0..20).map(|i| (format!("{i}_3.txt"), format!("n{i}"))).collect();
        write_files(&root.path().join("pos"), &pos);
        write_files(&root.path().join("neg"), &neg);

        let texts = |seed| {
            ReviewDataset::load_split(root.path(), Some(seed))
                .unwrap()
                .iter()
                .map(|review| review.text)
                .collect::<Vec<_>>()
        };
        assert_eq!(texts(11), texts(11));
    }

    #[test]
    fn class_ids_cover_exactly_the_two_labels() {
        for polarity in Polarity::ALL {
            assert_eq!(Polarity::from_class_id(polarity.class_id()), Some(polarity));
        }
        assert_eq!(Polarity::from_class_id(2), None);
    }

    #[test]
    fn batcher_pads_and_masks() {
        type B = NdArray<f32>;

        let vocabulary = Arc::new(Vocabulary::new(
            vec!["good".to_string(), "bad".to_string(), "film".to_string()],
            &EmbeddingConfig::new().with_oov_buckets(4),
        ));
        let batcher = ReviewBatcher::<B>::new(Default::default(), vocabulary, 8);

        let batch = batcher.batch(vec![
            Review {
                text: "good film".to_string(),
                raw_score: 8,
                polarity: Polarity::Positive,
            },
            Review {
                text: "bad".to_string(),
                raw_score: 1,
                polarity: Polarity::Negative,
            },
        ]);

        assert_eq!(batch.tokens.dims(), [2, 2]);
        let mask: Vec<f32> = batch.mask.into_data().iter::<f32>().collect();
        assert_eq!(mask, vec![1.0, 1.0, 1.0, 0.0]);
        let tokens: Vec<i64> = batch.tokens.into_data().iter::<i64>().collect();
        assert_eq!(tokens, vec![0, 2, 1, 0]);
        let targets: Vec<i64> = batch.targets.into_data().iter::<i64>().collect();
        assert_eq!(targets, vec![1, 0]);
    }
}
