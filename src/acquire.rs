//! Local caching of the review archive.

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use flate2::read::GzDecoder;
use tracing::{debug, info, instrument};

use crate::{
    data::ReviewDataset,
    error::{DatasetError, DownloadError},
};

pub const IMDB_ORIGIN: &str = "https://ai.stanford.edu/~amaas/data/sentiment/aclImdb_v1.tar.gz";

/// A gzipped tarball served from a fixed origin, laid out as `<root>/{train,test}/{pos,neg}`.
#[derive(Debug, Clone)]
pub struct DatasetArchive {
    pub origin: String,
    pub file_name: String,
    pub extracted_root: String,
}

impl DatasetArchive {
    pub fn imdb() -> Self {
        Self {
            origin: IMDB_ORIGIN.to_string(),
            file_name: "aclImdb.tar.gz".to_string(),
            extracted_root: "aclImdb".to_string(),
        }
    }

    /// Makes sure the archive is cached and extracted under `cache_dir`, returning the extracted root.
    ///
    /// A tree is only reused when its completion marker exists; anything else
    /// is replaced by a fresh extraction.
    #[instrument(skip(self, cache_dir), fields(origin = %self.origin))]
    pub fn acquire(&self, cache_dir: &Path, force: bool) -> Result<PathBuf, DatasetError> {
        let archive_path = cache_dir.join(&self.file_name);
        let root = cache_dir.join(&self.extracted_root);
        let marker = self.marker_path(cache_dir);

        let downloaded = if force || !archive_path.exists() {
            download_file(&self.origin, &archive_path)?;
            true
        } else {
            debug!(path = %archive_path.display(), "reusing cached archive");
            false
        };

        if downloaded || !marker.exists() || !root.exists() {
            self.extract(&archive_path, cache_dir)?;
        } else {
            debug!(root = %root.display(), "reusing extracted tree");
        }

        Ok(root)
    }

    fn marker_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(format!("{}.extracted", self.extracted_root))
    }

    /// Unpacks into a staging directory and moves the root into place only
    /// once the whole archive has been read.
    fn extract(&self, archive_path: &Path, cache_dir: &Path) -> Result<(), DatasetError> {
        let extract_error = |source| DatasetError::Extract {
            path: archive_path.to_path_buf(),
            source,
        };

        let marker = self.marker_path(cache_dir);
        let root = cache_dir.join(&self.extracted_root);
        let staging = cache_dir.join(format!("{}.staging", self.extracted_root));

        remove_if_present(&marker).map_err(extract_error)?;
        remove_dir_if_present(&staging).map_err(extract_error)?;

        info!(archive = %archive_path.display(), "extracting");

        let file = File::open(archive_path).map_err(extract_error)?;
        tar::Archive::new(GzDecoder::new(file))
            .unpack(&staging)
            .map_err(extract_error)?;

        let unpacked = staging.join(&self.extracted_root);
        if !unpacked.is_dir() {
            return Err(extract_error(io::Error::new(
                io::ErrorKind::NotFound,
                format!("archive has no {} directory", self.extracted_root),
            )));
        }

        remove_dir_if_present(&root).map_err(extract_error)?;
        fs::rename(&unpacked, &root).map_err(extract_error)?;
        remove_dir_if_present(&staging).map_err(extract_error)?;
        File::create(&marker).map_err(extract_error)?;

        Ok(())
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

/// Acquires `archive` and loads its train and test splits.
pub fn download_and_load_datasets(
    archive: &DatasetArchive,
    cache_dir: &Path,
    force: bool,
    seed: Option<u64>,
) -> Result<(ReviewDataset, ReviewDataset), DatasetError> {
    let root = archive.acquire(cache_dir, force)?;

    let train = ReviewDataset::load_split(&root.join("train"), seed)?;
    let test = ReviewDataset::load_split(&root.join("test"), seed)?;

    Ok((train, test))
}

/// Streams `url` into `dest`. The body goes to a `.part` sibling first so an
/// interrupted transfer never looks like a cached file.
pub fn download_file(url: &str, dest: &Path) -> Result<(), DownloadError> {
    let http_error = |source| DownloadError::Http {
        url: url.to_string(),
        source,
    };
    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| DownloadError::Io { path, source }
    };

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }

    let mut partial_name = dest.file_name().unwrap_or_default().to_os_string();
    partial_name.push(".part");
    let partial = dest.with_file_name(partial_name);

    info!(url, dest = %dest.display(), "downloading");

    let client = reqwest::blocking::Client::builder()
        .timeout(None::<Duration>)
        .build()
        .map_err(http_error)?;
    let mut response = client
        .get(url)
        .send()
        .and_then(|response| response.error_for_status())
        .map_err(http_error)?;

    let mut file = File::create(&partial).map_err(io_error(&partial))?;
    let bytes = response.copy_to(&mut file).map_err(http_error)?;
    fs::rename(&partial, dest).map_err(io_error(dest))?;

    info!(bytes, dest = %dest.display(), "download complete");

    Ok(())
}

/// A one-route HTTP/1.1 server on a loopback port that counts the requests it answers.
#[cfg(test)]
pub(crate) mod fixture_server {
    use std::{
        io::{BufRead, BufReader, Write},
        net::TcpListener,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    pub struct FixtureServer {
        pub base_url: String,
        requests: Arc<AtomicUsize>,
    }

    impl FixtureServer {
        pub fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    /// Answers every request with `200 OK` and `body`, whatever the path.
    pub fn serve(body: Vec<u8>) -> FixtureServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(AtomicUsize::new(0));

        let counter = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };

                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                while reader.read_line(&mut line).unwrap_or(0) > 0 && line != "\r\n" {
                    line.clear();
                }
                counter.fetch_add(1, Ordering::SeqCst);

                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                // A client that hangs up early only ends its own connection.
                if stream.write_all(head.as_bytes()).is_ok() && stream.write_all(&body).is_ok() {
                    stream.flush().ok();
                }
            }
        });

        FixtureServer { base_url, requests }
    }
}
