use anyhow::Context;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Builds the final output file out of segment part files.
pub struct Assembler {
    path: PathBuf,
    file: File,
    written: u64,
}

impl Assembler {
    pub async fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await
            .with_context(|| format!("open {:?}", path))?;

        Ok(Self { path: path.to_path_buf(), file, written: 0 })
    }

    pub async fn append_part(&mut self, part: &Path) -> anyhow::Result<u64> {
        let mut src = File::open(part)
            .await
            .with_context(|| format!("open part {:?}", part))?;
        let n = tokio::io::copy(&mut src, &mut self.file)
            .await
            .with_context(|| format!("copy {:?} into {:?}", part, self.path))?;
        self.written += n;
        Ok(n)
    }

    pub async fn finish(mut self) -> anyhow::Result<u64> {
        self.file.flush().await?;
        self.file.sync_all().await.ok();
        Ok(self.written)
    }
}

/// Concatenates `parts` in order into `output` and returns the final size.
/// A single part is moved into place instead of copied.
pub async fn merge_parts(parts: &[PathBuf], output: &Path) -> anyhow::Result<u64> {
    if let [only] = parts {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::rename(only, output).await.is_ok() {
            let meta = tokio::fs::metadata(output)
                .await
                .with_context(|| format!("stat {:?}", output))?;
            return Ok(meta.len());
        }
    }

    let mut assembler = Assembler::create(output).await?;
    for part in parts {
        assembler.append_part(part).await?;
    }
    assembler.finish().await
}
