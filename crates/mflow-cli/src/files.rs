//! Dumping messages to files and replaying them

use anyhow::{Context, Result};
use async_trait::async_trait;
use mflow::Payload;
use mflow_core::{Error, FrameSource, Handler};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::debug;

const EXTENSION: &str = "raw";

/// `<message:06>_<part:03>.raw`
pub fn frame_file_name(message: u64, part: u64) -> String {
    format!("{:06}_{:03}.{}", message, part, EXTENSION)
}

/// Writes every frame of every message to its own file
pub struct Dumper {
    folder: PathBuf,
    messages: u64,
}

impl Dumper {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            messages: 0,
        }
    }

    pub fn messages(&self) -> u64 {
        self.messages
    }
}

#[async_trait]
impl Handler for Dumper {
    async fn receive(&mut self, source: &mut dyn FrameSource) -> mflow_core::Result<Option<Payload>> {
        let mut part = 0u64;
        loop {
            let Some(frame) = source.next().await? else {
                break;
            };
            let path = self.folder.join(frame_file_name(self.messages, part));
            tokio::fs::write(&path, &frame)
                .await
                .map_err(|e| Error::Decode(format!("unable to write {}: {}", path.display(), e)))?;
            debug!("Wrote {}", path.display());
            part += 1;

            if !source.has_more() {
                break;
            }
        }

        if part == 0 {
            return Ok(None);
        }
        let message = self.messages;
        self.messages += 1;
        Ok(Some(Payload::Json(json!({"message": message, "parts": part}))))
    }
}

/// A dumped frame and whether more frames of the same message follow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayFrame {
    pub path: PathBuf,
    pub more: bool,
}

/// Dumped frames of `folder` in send order.
///
/// Consecutive files sharing the prefix before the first `_` form one
/// message; files without the dump extension are ignored.
pub async fn replay_plan(folder: &Path) -> Result<Vec<ReplayFrame>> {
    let mut entries = tokio::fs::read_dir(folder)
        .await
        .with_context(|| format!("Specified folder '{}' does not exist", folder.display()))?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(&format!(".{}", EXTENSION)) {
            names.push(name);
        }
    }
    names.sort();

    Ok(group_frames(&names)
        .into_iter()
        .map(|(name, more)| ReplayFrame {
            path: folder.join(name),
            more,
        })
        .collect())
}

fn message_prefix(name: &str) -> &str {
    name.split('_').next().unwrap_or(name)
}

fn group_frames(names: &[String]) -> Vec<(&str, bool)> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let more = names
                .get(i + 1)
                .is_some_and(|next| message_prefix(next) == message_prefix(name));
            (name.as_str(), more)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mflow_core::FrameBuffer;

    #[test]
    fn test_frame_file_name() {
        assert_eq!(frame_file_name(0, 0), "000000_000.raw");
        assert_eq!(frame_file_name(42, 7), "000042_007.raw");
    }

    #[test]
    fn test_group_frames() {
        let names: Vec<String> = [
            "000000_000.raw",
            "000000_001.raw",
            "000001_000.raw",
            "000002_000.raw",
            "000002_001.raw",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let flags: Vec<bool> = group_frames(&names).into_iter().map(|(_, more)| more).collect();
        assert_eq!(flags, vec![true, false, false, true, false]);
    }

    #[tokio::test]
    async fn test_dump_then_plan_replay() {
        let folder = tempfile::tempdir().unwrap();
        let mut dumper = Dumper::new(folder.path());

        let mut frames = FrameBuffer::new();
        frames.push_message([r#"{"htype":"raw-1.0"}"#, "one", "two"]);
        frames.push_message([r#"{"htype":"dseries_end-1.0"}"#]);

        assert!(dumper.receive(&mut frames).await.unwrap().is_some());
        assert!(dumper.receive(&mut frames).await.unwrap().is_some());
        assert_eq!(dumper.messages(), 2);

        std::fs::write(folder.path().join("notes.txt"), b"ignored").unwrap();

        let plan = replay_plan(folder.path()).await.unwrap();
        let flags: Vec<bool> = plan.iter().map(|frame| frame.more).collect();
        assert_eq!(flags, vec![true, true, false, false]);
        assert_eq!(std::fs::read(&plan[1].path).unwrap(), b"one");
        assert!(plan[3].path.ends_with("000001_000.raw"));
    }

    #[tokio::test]
    async fn test_replay_plan_missing_folder() {
        let folder = tempfile::tempdir().unwrap();
        assert!(replay_plan(&folder.path().join("missing")).await.is_err());
    }
}
