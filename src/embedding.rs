//! Resolution of embedding identifiers into vocabularies and word vectors.
//!
//! An identifier names a word-vector file, either local (`file://…` or a bare
//! path) or remote (`http(s)://…`, downloaded once into the cache). Prefixing
//! any identifier with `random:` keeps its vocabulary and network shape but
//! initializes every weight randomly.

use std::{
    cell::RefCell,
    collections::{hash_map::DefaultHasher, HashMap},
    fmt,
    fs::File,
    hash::{Hash, Hasher},
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use burn::prelude::*;
use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, instrument};

use crate::{
    acquire::download_file,
    error::EmbeddingError,
    module::text_embedding::{TextEmbedding, TextEmbeddingConfig},
};

pub const DEFAULT_EMBEDDING: &str =
    "https://dl.fbaipublicfiles.com/fasttext/vectors-crawl/cc.en.300.vec.gz";

const RANDOM_PREFIX: &str = "random:";

static BREAK_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid tag pattern"));

#[derive(Config, Debug)]
pub struct EmbeddingConfig {
    /// Words read from the top of a vector file.
    #[config(default = 200000)]
    pub max_vocab: usize,

    /// Hash buckets shared by out-of-vocabulary tokens.
    #[config(default = 20000)]
    pub oov_buckets: usize,

    #[config(default = 0.1)]
    pub init_std: f64,
}

/// Splits raw review text into tokens: markup line breaks become spaces and
/// leading/trailing ASCII punctuation is dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    BREAK_TAG
        .replace_all(text, " ")
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| c.is_ascii_punctuation()))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Maps tokens to embedding rows. Known words take rows `0..known`, unknown
/// tokens hash into one of the `oov_buckets` rows after them.
#[derive(Debug)]
pub struct Vocabulary {
    index: HashMap<String, usize>,
    known: usize,
    oov_buckets: usize,
}

impl Vocabulary {
    pub fn new(words: Vec<String>, config: &EmbeddingConfig) -> Self {
        let known = words.len();
        let mut index = HashMap::with_capacity(known);
        for (row, word) in words.into_iter().enumerate() {
            index.entry(word).or_insert(row);
        }

        Self {
            index,
            known,
            oov_buckets: config.oov_buckets,
        }
    }

    pub fn known_words(&self) -> usize {
        self.known
    }

    pub fn row_count(&self) -> usize {
        self.known + self.oov_buckets
    }

    /// Exact match first, then the lowercase form, then a hash bucket.
    pub fn lookup(&self, token: &str) -> Option<usize> {
        if let Some(&row) = self.index.get(token) {
            return Some(row);
        }

        let lower = token.to_lowercase();
        if let Some(&row) = self.index.get(&lower) {
            return Some(row);
        }

        if self.oov_buckets == 0 {
            return None;
        }

        let mut hasher = DefaultHasher::new();
        lower.hash(&mut hasher);
        Some(self.known + (hasher.finish() % self.oov_buckets as u64) as usize)
    }

    /// Rows of the first `max_tokens` tokens that resolve to a row.
    pub fn encode(&self, text: &str, max_tokens: usize) -> Vec<usize> {
        tokenize(text)
            .iter()
            .filter_map(|token| self.lookup(token))
            .take(max_tokens)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EmbeddingSource {
    Local(PathBuf),
    Remote(String),
    Random(Box<EmbeddingSource>),
}

impl FromStr for EmbeddingSource {
    type Err = EmbeddingError;

    fn from_str(identifier: &str) -> Result<Self, Self::Err> {
        let invalid = || EmbeddingError::InvalidIdentifier(identifier.to_string());
        let identifier = identifier.trim();

        if let Some(inner) = identifier.strip_prefix(RANDOM_PREFIX) {
            return match inner.parse::<EmbeddingSource>() {
                Ok(EmbeddingSource::Random(_)) | Err(_) => Err(invalid()),
                Ok(inner) => Ok(EmbeddingSource::Random(Box::new(inner))),
            };
        }

        if identifier.starts_with("http://") || identifier.starts_with("https://") {
            let has_file = identifier
                .rsplit('/')
                .next()
                .is_some_and(|segment| !segment.is_empty() && !segment.contains(':'));
            return if has_file {
                Ok(EmbeddingSource::Remote(identifier.to_string()))
            } else {
                Err(invalid())
            };
        }

        let path = identifier.strip_prefix("file://").unwrap_or(identifier);
        if path.is_empty() {
            return Err(invalid());
        }

        Ok(EmbeddingSource::Local(PathBuf::from(path)))
    }
}

impl fmt::Display for EmbeddingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbeddingSource::Local(path) => write!(f, "{}", path.display()),
            EmbeddingSource::Remote(url) => write!(f, "{url}"),
            EmbeddingSource::Random(inner) => write!(f, "{RANDOM_PREFIX}{inner}"),
        }
    }
}

impl EmbeddingSource {
    /// Short name used in experiment labels, e.g. `cc.en.300` or `random-cc.en.300`.
    pub fn name(&self) -> String {
        let file_name = match self {
            EmbeddingSource::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            EmbeddingSource::Remote(url) => url.rsplit('/').next().unwrap_or_default().to_string(),
            EmbeddingSource::Random(inner) => return format!("random-{}", inner.name()),
        };

        let name = file_name.strip_suffix(".gz").unwrap_or(&file_name);
        let name = name
            .strip_suffix(".vec")
            .or_else(|| name.strip_suffix(".txt"))
            .unwrap_or(name);
        name.to_string()
    }
}

/// Word vectors read from a file, row-major `[known_words, dim]`.
#[derive(Debug)]
pub struct WordVectors {
    pub vocabulary: Arc<Vocabulary>,
    pub dim: usize,
    pub values: Vec<f32>,
}

/// Reads a text word-vector file (`word v1 … vd` per line, optional
/// `count dim` header, gzip when the name ends in `.gz`).
pub fn read_word_vectors(path: &Path, config: &EmbeddingConfig) -> Result<WordVectors, EmbeddingError> {
    let io_error = |source| EmbeddingError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parse_error = |line: usize, reason: String| EmbeddingError::Parse {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let file = File::open(path).map_err(io_error)?;
    let reader: Box<dyn BufRead> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut words = Vec::new();
    let mut values = Vec::new();
    let mut dim = None;

    for (index, line) in reader.lines().enumerate() {
        if words.len() >= config.max_vocab {
            break;
        }

        let line = line.map_err(io_error)?;
        let mut fields = line.split_whitespace();
        let Some(word) = fields.next() else {
            continue;
        };
        let vector = fields
            .map(str::parse::<f32>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| parse_error(index + 1, err.to_string()))?;

        if index == 0 && vector.len() == 1 && word.parse::<usize>().is_ok() {
            debug!(header = %line, "skipping vector file header");
            continue;
        }

        if vector.is_empty() {
            return Err(parse_error(index + 1, format!("no values for {word:?}")));
        }

        match dim {
            None => dim = Some(vector.len()),
            Some(dim) if dim != vector.len() => {
                return Err(parse_error(
                    index + 1,
                    format!("expected {dim} values, found {}", vector.len()),
                ))
            }
            Some(_) => {}
        }

        words.push(word.to_string());
        values.extend(vector);
    }

    let Some(dim) = dim else {
        return Err(EmbeddingError::Empty(path.to_path_buf()));
    };

    info!(path = %path.display(), words = words.len(), dim, "loaded word vectors");

    Ok(WordVectors {
        vocabulary: Arc::new(Vocabulary::new(words, config)),
        dim,
        values,
    })
}

/// An identifier resolved into a vocabulary and, unless random, its pretrained vectors.
#[derive(Debug, Clone)]
pub struct ResolvedEmbedding {
    pub source: EmbeddingSource,
    pub vocabulary: Arc<Vocabulary>,
    pub dim: usize,
    pretrained: Option<Arc<WordVectors>>,
    init_std: f64,
}

impl ResolvedEmbedding {
    pub fn is_pretrained(&self) -> bool {
        self.pretrained.is_some()
    }

    /// Builds the embedding module. A frozen module gets no gradients and
    /// acts as a fixed feature extractor.
    pub fn init<B: Backend>(&self, train_module: bool, device: &B::Device) -> TextEmbedding<B> {
        let config = TextEmbeddingConfig::new(self.vocabulary.row_count(), self.dim)
            .with_init_std(self.init_std);

        let embedding = match &self.pretrained {
            Some(vectors) => config.init_pretrained(&vectors.values, device),
            None => config.init(device),
        };

        if train_module {
            embedding
        } else {
            embedding.no_grad()
        }
    }
}

/// Resolves identifiers, caching downloads under `cache_dir` and parsed
/// vector files for the lifetime of the registry.
pub struct EmbeddingRegistry {
    cache_dir: PathBuf,
    config: EmbeddingConfig,
    loaded: RefCell<HashMap<EmbeddingSource, Arc<WordVectors>>>,
}

impl EmbeddingRegistry {
    pub fn new(cache_dir: impl Into<PathBuf>, config: EmbeddingConfig) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            config,
            loaded: RefCell::new(HashMap::new()),
        }
    }

    #[instrument(skip(self))]
    pub fn resolve(&self, identifier: &str) -> Result<ResolvedEmbedding, EmbeddingError> {
        let source: EmbeddingSource = identifier.parse()?;

        let (base, random) = match &source {
            EmbeddingSource::Random(inner) => (inner.as_ref(), true),
            other => (other, false),
        };
        let vectors = self.word_vectors(base)?;

        Ok(ResolvedEmbedding {
            vocabulary: vectors.vocabulary.clone(),
            dim: vectors.dim,
            pretrained: (!random).then_some(vectors),
            init_std: self.config.init_std,
            source,
        })
    }

    fn word_vectors(&self, source: &EmbeddingSource) -> Result<Arc<WordVectors>, EmbeddingError> {
        if let Some(vectors) = self.loaded.borrow().get(source) {
            return Ok(vectors.clone());
        }

        let path = match source {
            EmbeddingSource::Local(path) => path.clone(),
            EmbeddingSource::Remote(url) => {
                let file_name = url.rsplit('/').next().unwrap_or_default();
                let path = self.cache_dir.join(file_name);
                if !path.exists() {
                    download_file(url, &path)?;
                }
                path
            }
            EmbeddingSource::Random(_) => {
                return Err(EmbeddingError::InvalidIdentifier(source.to_string()))
            }
        };

        let vectors = Arc::new(read_word_vectors(&path, &self.config)?);
        self.loaded
            .borrow_mut()
            .insert(source.clone(), vectors.clone());

        Ok(vectors)
    }
}
