use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use crossbeam::channel::{self, Receiver, Sender};
use serde::Serialize;
use thiserror::Error;

const EXTENSION: &str = "txt";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("invalid history file name: {0:?}")]
    InvalidName(String),
    #[error("history record not found: {0}")]
    NotFound(String),
    #[error("history {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRecord {
    pub filename: String,
    pub modified: DateTime<Local>,
}

/// Transcripts of finished runs, one text file per run named after the time
/// it was saved.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        HistoryStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn io_err(path: &Path, source: std::io::Error) -> HistoryError {
        HistoryError::Io {
            path: path.to_owned(),
            source,
        }
    }

    /// Save a transcript as `YYYYmmdd_HHMMSS.txt` and return the file name.
    /// Saves within the same second get a `_N` suffix.
    pub fn save(&self, output: &str) -> Result<String, HistoryError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Self::io_err(&self.dir, e))?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        for n in 0.. {
            let filename = if n == 0 {
                format!("{}.{}", stamp, EXTENSION)
            } else {
                format!("{}_{}.{}", stamp, n, EXTENSION)
            };
            let path = self.dir.join(&filename);
            match utils::fs::write_new_file(&path, output) {
                Ok(()) => return Ok(filename),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Self::io_err(&path, e)),
            }
        }
        unreachable!("ran out of history file names")
    }

    /// All records, newest first.
    pub fn list(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let files = utils::fs::list_files(&self.dir, |name| {
            Path::new(name).extension().map_or(false, |ext| ext == EXTENSION)
        })
        .map_err(|e| Self::io_err(&self.dir, e))?;
        Ok(files
            .into_iter()
            .map(|f| HistoryRecord {
                filename: f.name,
                modified: f.modified.into(),
            })
            .collect())
    }

    fn path(&self, filename: &str) -> Result<PathBuf, HistoryError> {
        if !utils::fs::is_plain_file_name(filename) {
            return Err(HistoryError::InvalidName(filename.to_owned()));
        }
        Ok(self.dir.join(filename))
    }

    pub fn read(&self, filename: &str) -> Result<String, HistoryError> {
        let path = self.path(filename)?;
        std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HistoryError::NotFound(filename.to_owned()),
            _ => Self::io_err(&path, e),
        })
    }

    pub fn delete(&self, filename: &str) -> Result<(), HistoryError> {
        let path = self.path(filename)?;
        std::fs::remove_file(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HistoryError::NotFound(filename.to_owned()),
            _ => Self::io_err(&path, e),
        })
    }
}

#[derive(Debug)]
enum HistoryOp {
    Save(String),
    Flush(Sender<()>),
    Stop,
}

/// Background writer for run transcripts.
///
/// `submit` only enqueues; a dedicated thread writes the files and failures
/// end up in the log. Dropping the writer flushes the queue.
pub struct HistoryWriter {
    tx: Sender<HistoryOp>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl HistoryWriter {
    pub fn spawn(store: HistoryStore) -> Self {
        let (tx, rx) = channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("history-writer".to_owned())
            .spawn(move || history_worker(store, rx))
            .ok();
        if handle.is_none() {
            log::error!("failed to start the history writer thread, transcripts will not be saved");
        }
        HistoryWriter { tx, handle }
    }

    pub fn submit(&self, output: String) {
        if self.tx.send(HistoryOp::Save(output)).is_err() {
            log::error!("history writer is gone, transcript dropped");
        }
    }

    /// Block until every transcript submitted so far has been handled.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = channel::bounded(1);
        if self.tx.send(HistoryOp::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for HistoryWriter {
    fn drop(&mut self) {
        let _ = self.tx.send(HistoryOp::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("history writer thread panicked");
            }
        }
    }
}

fn history_worker(store: HistoryStore, rx: Receiver<HistoryOp>) {
    for op in rx.iter() {
        match op {
            HistoryOp::Save(output) => match store.save(&output) {
                Ok(filename) => {
                    log::info!("history saved to {}", store.dir().join(filename).display())
                }
                Err(e) => log::error!("failed to save history: {}", e),
            },
            HistoryOp::Flush(ack) => {
                let _ = ack.send(());
            }
            HistoryOp::Stop => break,
        }
    }
}
