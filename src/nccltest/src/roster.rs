use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("invalid iplist file name: {0:?}")]
    InvalidName(String),
    #[error("iplist not found: {0}")]
    NotFound(String),
    #[error("iplist {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterFile {
    pub filename: String,
    pub modified: DateTime<Local>,
    pub size: u64,
}

/// Node address lists, one file per roster under the iplist directory. The
/// files double as mpirun hostfiles.
#[derive(Debug, Clone)]
pub struct RosterStore {
    dir: PathBuf,
}

/// Split roster text into addresses: one per line, trimmed, blanks dropped.
pub fn parse_roster(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}

impl RosterStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        RosterStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> Result<PathBuf, RosterError> {
        if !utils::fs::is_plain_file_name(name) {
            return Err(RosterError::InvalidName(name.to_owned()));
        }
        Ok(self.dir.join(name))
    }

    /// Read a roster. A roster that does not exist reads as empty.
    pub fn read(&self, name: &str) -> Result<Vec<String>, RosterError> {
        let path = self.path(name)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(parse_roster(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("iplist {} does not exist, treat it as empty", path.display());
                Ok(Vec::new())
            }
            Err(source) => Err(RosterError::Io {
                name: name.to_owned(),
                source,
            }),
        }
    }

    pub fn save(&self, name: &str, addrs: &[String]) -> Result<(), RosterError> {
        let path = self.path(name)?;
        let io_err = |source| RosterError::Io {
            name: name.to_owned(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let entries: Vec<_> = addrs
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .collect();
        let mut content = entries.join("\n");
        content.push('\n');
        std::fs::write(&path, content).map_err(io_err)?;
        log::info!("saved {} addresses to {}", entries.len(), path.display());
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), RosterError> {
        let path = self.path(name)?;
        std::fs::remove_file(&path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => RosterError::NotFound(name.to_owned()),
            _ => RosterError::Io {
                name: name.to_owned(),
                source,
            },
        })?;
        log::info!("deleted iplist {}", path.display());
        Ok(())
    }

    /// All rosters, newest first.
    pub fn list(&self) -> Result<Vec<RosterFile>, RosterError> {
        let files = utils::fs::list_files(&self.dir, |_| true).map_err(|source| {
            RosterError::Io {
                name: self.dir.display().to_string(),
                source,
            }
        })?;
        Ok(files
            .into_iter()
            .map(|f| RosterFile {
                filename: f.name,
                modified: f.modified.into(),
                size: f.size,
            })
            .collect())
    }
}
