use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Create `path` and write `content` to it, failing if the file already exists.
pub fn write_new_file<P: AsRef<Path>>(path: P, content: &str) -> std::io::Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    f.write_all(content.as_bytes())?;
    f.flush()
}

/// A regular file found by [`list_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
}

/// List the regular files directly under `dir` that pass `filter`, newest
/// first. A missing directory is an empty listing.
pub fn list_files<P, F>(dir: P, mut filter: F) -> std::io::Result<Vec<FileEntry>>
where
    P: AsRef<Path>,
    F: FnMut(&str) -> bool,
{
    let entries = match std::fs::read_dir(dir.as_ref()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                log::debug!("skip {:?}: {}", entry.path(), e);
                continue;
            }
        };
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !filter(&name) {
            continue;
        }
        files.push(FileEntry {
            name,
            path: entry.path(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: meta.len(),
        });
    }

    files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
    Ok(files)
}

/// Whether `name` is a plain file name: non-empty, no path separator, not `.` or `..`.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}
