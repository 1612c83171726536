//! 暂存写入与原子发布。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 写入暂存目录、完成后原子重命名到目标路径的临时文件。
///
/// 未调用 [`AtomicFile::publish`] 就被丢弃时（例如客户端中途断开），
/// 暂存文件会被删除，目标路径保持不变。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    written: u64,
}

impl AtomicFile {
    /// 在暂存目录中创建临时文件。
    pub async fn create(target: &Path, staging_dir: &Path) -> io::Result<Self> {
        let temp_path = staging_dir.join(format!("{}.part", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file: Some(file),
            written: 0,
        })
    }

    /// 追加一段数据。
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("staged file already closed"))?;
        file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// 已写入的字节数。
    pub fn written(&self) -> u64 {
        self.written
    }

    /// 放弃并清理临时文件。
    pub async fn discard(mut self) {
        drop(self.file.take());
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步数据并原子替换目标文件，同名文件被覆盖。
    pub async fn publish(mut self) -> io::Result<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("staged file already closed"))?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok()
                    && fs::rename(&self.temp_path, &self.target).await.is_ok()
                {
                    return Ok(());
                }
            }
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
