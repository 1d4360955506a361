//! File operations

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::errors::EngineError;

/// Bytes read per step when tailing from the end of a file
const TAIL_BLOCK: u64 = 64 * 1024;

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, EngineError> {
        Ok(fs::read_to_string(&self.path).await?)
    }

    /// Read file contents, or an empty string when the file does not exist yet
    pub async fn read_string_or_empty(&self) -> Result<String, EngineError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Return the last `lines` lines of the file. A missing file reads as empty.
    ///
    /// Reads backwards from the end in fixed-size blocks, so the cost depends
    /// on the window asked for rather than on the size of the file.
    pub async fn tail(&self, lines: usize) -> Result<String, EngineError> {
        if lines == 0 {
            return Ok(String::new());
        }

        let mut file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };

        let mut pos = file.metadata().await?.len();
        let mut buf: Vec<u8> = Vec::new();
        let mut newlines = 0;
        // One extra newline covers the file's trailing one.
        while pos > 0 && newlines <= lines {
            let step = TAIL_BLOCK.min(pos);
            pos -= step;

            let mut block = vec![0u8; step as usize];
            file.seek(SeekFrom::Start(pos)).await?;
            file.read_exact(&mut block).await?;

            newlines += block.iter().filter(|b| **b == b'\n').count();
            block.extend_from_slice(&buf);
            buf = block;
        }

        Ok(tail_lines(&String::from_utf8_lossy(&buf), lines))
    }

    /// Write string to file
    pub async fn write_string(&self, contents: &str) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&self.path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Write a secret to a file that is owner-read/write from the moment it is created
    pub async fn write_private(&self, contents: &str) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        // The file may have pre-existed with wider permissions.
        self.set_permissions_600().await
    }

    /// Delete the file
    pub async fn delete(&self) -> Result<(), EngineError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Set file permissions to owner-read/write only (0o600) on Unix.
    ///
    /// A no-op on non-Unix platforms.
    pub async fn set_permissions_600(&self) -> Result<(), EngineError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = fs::metadata(&self.path).await?;
            let mut perms = meta.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms).await?;
        }
        Ok(())
    }
}

/// Keep the last `lines` lines of `contents`, preserving a trailing newline.
pub fn tail_lines(contents: &str, lines: usize) -> String {
    if lines == 0 || contents.is_empty() {
        return String::new();
    }

    let trimmed = contents.strip_suffix('\n').unwrap_or(contents);
    let start = trimmed
        .rmatch_indices('\n')
        .nth(lines - 1)
        .map(|(idx, _)| idx + 1)
        .unwrap_or(0);

    contents[start..].to_string()
}
