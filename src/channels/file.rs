use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tokio::io::AsyncWriteExt;

use crate::notification::Notification;

use super::{ChannelError, ChannelKind, DispatchResult};

/// Appends notification records to files under a log directory.
pub struct FileChannel {
    root: PathBuf,
}

impl FileChannel {
    /// Create the log directory if needed and pin its canonical path.
    pub fn new(log_dir: &str) -> Result<Self, ChannelError> {
        std::fs::create_dir_all(log_dir)?;
        let root = std::fs::canonicalize(log_dir)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    #[tracing::instrument(
        name = "channel.file",
        skip(self, notification),
        fields(notification_id = %notification.log_id())
    )]
    pub async fn send(&self, notification: &Notification) -> Result<DispatchResult, ChannelError> {
        let filename = if notification.recipient.is_empty() {
            format!("notification_{}.log", Utc::now().timestamp())
        } else {
            notification.recipient.clone()
        };

        let path = self.resolve(&filename).await?;
        let entry = format_entry(notification);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;

        tracing::debug!(file = %path.display(), bytes = entry.len(), "Notification appended");

        Ok(DispatchResult::ok(
            ChannelKind::File,
            json!({
                "file": path.display().to_string(),
                "written": entry.len(),
            }),
        ))
    }

    /// Map a relative file name to a path that stays inside the root.
    async fn resolve(&self, name: &str) -> Result<PathBuf, ChannelError> {
        let relative = Path::new(name);
        let lexically_safe = !relative.as_os_str().is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !lexically_safe || name.contains('\\') || name.contains('\0') {
            return Err(ChannelError::PathEscape(name.to_string()));
        }

        let joined = self.root.join(relative);
        let parent = joined
            .parent()
            .ok_or_else(|| ChannelError::PathEscape(name.to_string()))?;

        // Symlinks inside the root could still point elsewhere, so the
        // existing part of the path is checked before anything is created
        let (existing, missing) = split_existing(parent).await?;
        let base = tokio::fs::canonicalize(&existing).await?;
        if !base.starts_with(&self.root) {
            return Err(ChannelError::PathEscape(name.to_string()));
        }
        let target = missing.iter().fold(base, |dir, part| dir.join(part));
        tokio::fs::create_dir_all(&target).await?;

        let canonical_parent = tokio::fs::canonicalize(&target).await?;
        if !canonical_parent.starts_with(&self.root) {
            return Err(ChannelError::PathEscape(name.to_string()));
        }

        let file_name = joined
            .file_name()
            .ok_or_else(|| ChannelError::PathEscape(name.to_string()))?;
        Ok(canonical_parent.join(file_name))
    }
}

/// Split a path into its deepest existing ancestor and the missing components below it.
async fn split_existing(path: &Path) -> Result<(PathBuf, Vec<OsString>), ChannelError> {
    let mut current = path.to_path_buf();
    let mut missing = Vec::new();
    loop {
        match tokio::fs::symlink_metadata(&current).await {
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let part = current
                    .file_name()
                    .map(OsStr::to_os_string)
                    .ok_or_else(|| ChannelError::PathEscape(path.display().to_string()))?;
                missing.push(part);
                if !current.pop() {
                    return Err(ChannelError::PathEscape(path.display().to_string()));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    missing.reverse();
    Ok((current, missing))
}

fn format_entry(notification: &Notification) -> String {
    let metadata: BTreeMap<&String, &String> = notification.metadata.iter().collect();
    let metadata = serde_json::to_string(&metadata).unwrap_or_else(|_| "{}".to_string());

    format!(
        "[{}] Subject: {}\nMessage: {}\nMetadata: {}\n---\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        notification.subject,
        notification.message,
        metadata
    )
}
