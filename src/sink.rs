//! Directory-backed evidence sink.
//!
//! Each blob is written to a hidden temp file in the target directory,
//! fsynced, then renamed into place, so a reader never observes a partial
//! record. Existing records are never overwritten. The filesystem work runs
//! on tokio's blocking pool.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::traits::EvidenceSink;

pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.contains("..")
    {
        bail!("invalid evidence file name: {:?}", name);
    }
    Ok(())
}

/// Blocking write: temp file, fsync, rename. Runs on the blocking pool.
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output dir: {}", dir.display()))?;

    let target = dir.join(name);
    if target.exists() {
        bail!("evidence file already exists: {}", target.display());
    }

    let tmp_path = dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()));
    let written = (|| -> std::io::Result<()> {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
        Ok(())
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e).with_context(|| format!("Failed to write {}", tmp_path.display()));
    }

    if let Err(e) = fs::rename(&tmp_path, &target) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e).with_context(|| format!("Failed to move into {}", target.display()));
    }
    Ok(target)
}

#[async_trait]
impl EvidenceSink for DirectorySink {
    async fn write(&self, name: &str, bytes: &[u8]) -> Result<String> {
        check_name(name)?;
        let dir = self.dir.clone();
        let owned_name = name.to_string();
        let owned = bytes.to_vec();
        let target = tokio::task::spawn_blocking(move || write_atomic(&dir, &owned_name, &owned))
            .await
            .context("evidence write task panicked")??;

        tracing::debug!(location = %target.display(), bytes = bytes.len(), "evidence written");
        Ok(target.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_whole_file_and_leaves_no_temp() {
        let tmp = TempDir::new().unwrap();
        let sink = DirectorySink::new(tmp.path().join("out"));
        let location = sink.write("0000_abc.json", b"{}").await.unwrap();
        assert!(location.ends_with("0000_abc.json"));
        assert_eq!(fs::read(&location).unwrap(), b"{}");

        let names: Vec<_> = fs::read_dir(sink.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["0000_abc.json".to_string()]);
    }

    #[tokio::test]
    async fn refuses_overwrite_and_path_names() {
        let tmp = TempDir::new().unwrap();
        let sink = DirectorySink::new(tmp.path());
        sink.write("a.json", b"1").await.unwrap();
        assert!(sink.write("a.json", b"2").await.is_err());
        assert_eq!(fs::read(tmp.path().join("a.json")).unwrap(), b"1");
        assert!(sink.write("../x.json", b"1").await.is_err());
        assert!(sink.write("sub/x.json", b"1").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_writes_all_land() {
        let tmp = TempDir::new().unwrap();
        let sink = std::sync::Arc::new(DirectorySink::new(tmp.path().join("out")));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let sink = sink.clone();
                tokio::spawn(async move {
                    sink.write(&format!("{i:04}_x.json"), format!("{i}").as_bytes())
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut names: Vec<_> = fs::read_dir(sink.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names.len(), 8);
        assert!(names.iter().all(|n| !n.starts_with('.')));
        assert_eq!(fs::read_to_string(sink.dir().join("0005_x.json")).unwrap(), "5");
    }
}
