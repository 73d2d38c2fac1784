//! 临时分片文件：预分配与按偏移写入。

use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use crate::error::{UploadError, UploadResult};

/// 写入缓冲大小，用于摊薄系统调用开销。
const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// 创建文件并扩展到 `size` 字节（文件系统支持时为稀疏文件）。
pub async fn preallocate(path: &Path, size: u64) -> UploadResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let file = File::create(path).await?;
    file.set_len(size).await?;
    Ok(())
}

/// 从 `reader` 读取恰好 `length` 字节写入 `offset` 处，返回写入字节数。
///
/// 输入流提前结束或读取出错时返回 [`UploadError::ShortWrite`]；
/// 打开、定位或写入文件失败时返回 [`UploadError::Io`]。
pub async fn write_at<R>(path: &Path, offset: u64, reader: R, length: u64) -> UploadResult<u64>
where
    R: AsyncRead,
{
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let limited = reader.take(length);
    tokio::pin!(limited);

    let mut buf = vec![0u8; WRITE_BUFFER_SIZE.min(length as usize).max(1)];
    let mut written: u64 = 0;
    while written < length {
        let read = match limited.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                warn!(error = %err, written, "chunk body read failed");
                break;
            }
        };
        file.write_all(&buf[..read]).await?;
        written += read as u64;
    }
    file.flush().await?;

    if written != length {
        return Err(UploadError::ShortWrite {
            expected: length,
            written,
        });
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tempfile::tempdir;

    #[tokio::test]
    async fn preallocate_sets_declared_length() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("a.part");
        preallocate(&path, 4096).await.expect("preallocate");
        assert_eq!(std::fs::metadata(&path).expect("metadata").len(), 4096);
    }

    #[tokio::test]
    async fn writes_at_offset_without_growing_file() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("a.part");
        preallocate(&path, 10).await.expect("preallocate");

        let written = write_at(&path, 5, &b"BBBBB"[..], 5).await.expect("write tail");
        assert_eq!(written, 5);
        write_at(&path, 0, &b"AAAAA"[..], 5).await.expect("write head");

        assert_eq!(std::fs::read(&path).expect("read"), b"AAAAABBBBB");
    }

    #[tokio::test]
    async fn never_reads_past_declared_length() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("a.part");
        preallocate(&path, 6).await.expect("preallocate");

        let written = write_at(&path, 0, &b"abcdefgh"[..], 3).await.expect("write");
        assert_eq!(written, 3);
        assert_eq!(std::fs::read(&path).expect("read"), b"abc\0\0\0");
    }

    #[tokio::test]
    async fn early_end_of_stream_is_short_write() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("a.part");
        preallocate(&path, 10).await.expect("preallocate");

        let result = write_at(&path, 0, &b"abc"[..], 5).await;
        assert!(matches!(
            result,
            Err(UploadError::ShortWrite {
                expected: 5,
                written: 3
            })
        ));
    }

    #[tokio::test]
    async fn broken_stream_is_short_write() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("a.part");
        preallocate(&path, 10).await.expect("preallocate");

        let reader = readers::failing_after(b"ab");
        let result = write_at(&path, 0, reader, 5).await;
        assert!(matches!(
            result,
            Err(UploadError::ShortWrite { written: 2, .. })
        ));
    }

    #[tokio::test]
    async fn missing_artifact_is_io_error() {
        let temp = tempdir().expect("tempdir");
        let result = write_at(&temp.path().join("missing.part"), 0, &b"a"[..], 1).await;
        assert!(matches!(result, Err(UploadError::Io(err)) if err.kind() == io::ErrorKind::NotFound));
    }

    mod readers {
        use std::io;
        use std::pin::Pin;
        use std::task::{Context, Poll};
        use tokio::io::{AsyncRead, ReadBuf};

        /// 先返回给定数据，随后报告连接中断。
        pub struct FailingReader {
            data: &'static [u8],
        }

        pub fn failing_after(data: &'static [u8]) -> FailingReader {
            FailingReader { data }
        }

        impl AsyncRead for FailingReader {
            fn poll_read(
                mut self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                if self.data.is_empty() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "client went away",
                    )));
                }
                let data = self.data;
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                self.data = &data[n..];
                Poll::Ready(Ok(()))
            }
        }
    }
}
