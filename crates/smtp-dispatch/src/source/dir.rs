use crate::error::SetupError;
use crate::source::{Message, MessageSource};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Every `*.eml` file below a directory, in lexical order
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self, SetupError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SetupError::NotADirectory { path: root });
        }
        Ok(Self { root })
    }

    fn scan(root: &Path) -> Vec<String> {
        let mut files = vec![];
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("skipping unreadable entry: {err:#}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().and_then(|ext| ext.to_str()) != Some("eml") {
                continue;
            }
            files.push(entry.path().display().to_string());
        }
        files
    }
}

#[async_trait]
impl MessageSource for DirSource {
    async fn list(&self) -> Result<Vec<String>, SetupError> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || Self::scan(&root))
            .await
            .map_err(|err| SetupError::Listing {
                path: self.root.clone(),
                reason: format!("{err:#}"),
            })?;
        tracing::info!(
            "found {} eml files in {}",
            files.len(),
            self.root.display()
        );
        Ok(files)
    }

    async fn fetch(&self, id: &str) -> anyhow::Result<Message> {
        let content = tokio::fs::read(id)
            .await
            .with_context(|| format!("reading {id}"))?;
        Ok(Message {
            id: id.to_string(),
            content: Bytes::from(content),
        })
    }
}
