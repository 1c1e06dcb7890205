use super::{Error, Source};
use bytes::Bytes;
use std::{
    fs::{File, OpenOptions},
    path::Path,
    sync::Arc,
};
use tokio::task;

/// A [Source] backed by a file on disk.
///
/// All I/O is positional (`pread`/`pwrite`) and runs on the blocking pool,
/// so concurrent readers do not contend on a shared file pointer.
#[derive(Clone)]
pub struct FileSource {
    file: Arc<File>,
}

impl FileSource {
    /// Open the file at `path` in read-write mode, creating it if it does
    /// not exist. Returns the source and the current file length.
    pub async fn open(path: impl AsRef<Path>) -> Result<(Self, u64), Error> {
        let path = path.as_ref().to_owned();
        let (file, len) = task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            let len = file.metadata()?.len();
            Ok::<_, std::io::Error>((file, len))
        })
        .await
        .map_err(|_| Error::ReadFailed)??;
        Ok((
            Self {
                file: Arc::new(file),
            },
            len,
        ))
    }

    /// Resize the file to `len` bytes, zero-extending if it grows.
    pub async fn resize(&self, len: u64) -> Result<(), Error> {
        let file = self.file.clone();
        task::spawn_blocking(move || file.set_len(len))
            .await
            .map_err(|_| Error::WriteFailed)??;
        Ok(())
    }
}

impl Source for FileSource {
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        offset
            .checked_add(len as u64)
            .ok_or(Error::OffsetOverflow)?;
        let file = self.file.clone();
        task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            let mut read = 0;
            while read < len {
                #[cfg(unix)]
                let n = {
                    use std::os::unix::fs::FileExt;
                    file.read_at(&mut buf[read..], offset + read as u64)?
                };
                #[cfg(windows)]
                let n = {
                    use std::os::windows::fs::FileExt;
                    file.seek_read(&mut buf[read..], offset + read as u64)?
                };
                if n == 0 {
                    // End of file: return what we have.
                    buf.truncate(read);
                    break;
                }
                read += n;
            }
            Ok::<_, std::io::Error>(Bytes::from(buf))
        })
        .await
        .map_err(|_| Error::ReadFailed)?
        .map_err(Error::Io)
    }

    async fn write_at(&self, buf: Bytes, offset: u64) -> Result<usize, Error> {
        offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::OffsetOverflow)?;
        let file = self.file.clone();
        task::spawn_blocking(move || {
            #[cfg(unix)]
            {
                use std::os::unix::fs::FileExt;
                file.write_all_at(&buf, offset)?;
            }
            #[cfg(windows)]
            {
                use std::os::windows::fs::FileExt;
                let mut written = 0;
                while written < buf.len() {
                    written += file.seek_write(&buf[written..], offset + written as u64)?;
                }
            }
            Ok::<_, std::io::Error>(buf.len())
        })
        .await
        .map_err(|_| Error::WriteFailed)?
        .map_err(Error::Io)
    }

    async fn size(&self) -> Result<u64, Error> {
        let file = self.file.clone();
        let len = task::spawn_blocking(move || file.metadata().map(|m| m.len()))
            .await
            .map_err(|_| Error::ReadFailed)??;
        Ok(len)
    }

    async fn sync(&self) -> Result<(), Error> {
        let file = self.file.clone();
        task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(|_| Error::WriteFailed)??;
        Ok(())
    }

    async fn close(self) -> Result<(), Error> {
        self.sync().await
    }
}
