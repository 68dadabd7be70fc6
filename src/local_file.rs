use std::io;
use std::ops::Range;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// Scoped read/write access to one on-disk payload file at byte offsets.
///
/// Files are opened per operation; writes past the current end extend the
/// file, leaving unwritten gaps zero-filled, which is how partial downloads
/// land at their correct offsets before earlier ranges exist.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
}

impl LocalFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read exactly the requested byte range.
    pub async fn read_range(&self, range: Range<u64>) -> io::Result<Vec<u8>> {
        let mut file = OpenOptions::new().read(true).open(&self.path).await?;
        file.seek(SeekFrom::Start(range.start)).await?;

        let mut buffer = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buffer).await?;
        Ok(buffer)
    }

    /// Write `data` starting at `offset`.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }
}
