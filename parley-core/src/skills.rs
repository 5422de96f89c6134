// ABOUTME: Materializes a session's selected skills into its working directory before a turn.
// ABOUTME: Copies skill folders from a shared library into <working_dir>/.claude/skills/.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait SkillSync: Send + Sync {
    async fn sync(&self, session_id: &str, skill_ids: &[String], working_dir: &Path) -> Result<()>;
}

/// Does nothing; used when no skills library is configured
pub struct NoopSkillSync;

#[async_trait]
impl SkillSync for NoopSkillSync {
    async fn sync(&self, _session_id: &str, _skill_ids: &[String], _working_dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Copies `<library>/<skill_id>/` to `<working_dir>/.claude/skills/<skill_id>/`
pub struct DirectorySkillSync {
    library: PathBuf,
}

impl DirectorySkillSync {
    pub fn new<P: AsRef<Path>>(library: P) -> Self {
        Self {
            library: library.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl SkillSync for DirectorySkillSync {
    async fn sync(&self, session_id: &str, skill_ids: &[String], working_dir: &Path) -> Result<()> {
        if skill_ids.is_empty() {
            return Ok(());
        }
        let library = self.library.clone();
        let session_id = session_id.to_string();
        let skill_ids = skill_ids.to_vec();
        let working_dir = working_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            sync_blocking(&library, &session_id, &skill_ids, &working_dir)
        })
        .await
        .context("Skill sync task panicked")?
    }
}

fn sync_blocking(library: &Path, session_id: &str, skill_ids: &[String], working_dir: &Path) -> Result<()> {
    let target_root = working_dir.join(".claude").join("skills");
    std::fs::create_dir_all(&target_root)
        .with_context(|| format!("Failed to create {}", target_root.display()))?;

    for skill_id in skill_ids {
        if skill_id.is_empty() || skill_id.contains("..") || skill_id.contains('/') {
            tracing::warn!(session_id = %session_id, skill = %skill_id, "Skipping invalid skill id");
            continue;
        }
        let source = library.join(skill_id);
        if !source.is_dir() {
            tracing::warn!(
                session_id = %session_id,
                skill = %skill_id,
                library = %library.display(),
                "Skill not found in library, skipping"
            );
            continue;
        }
        let target = target_root.join(skill_id);
        std::fs::create_dir_all(&target)
            .with_context(|| format!("Failed to create {}", target.display()))?;
        copy_dir_contents(&source, &target)?;
        tracing::debug!(session_id = %session_id, skill = %skill_id, "Skill synced");
    }
    Ok(())
}

/// Recursively copy all contents from source directory to destination
fn copy_dir_contents(src: &Path, dst: &Path) -> Result<()> {
    for entry in std::fs::read_dir(src)
        .with_context(|| format!("Failed to read skill directory {}", src.display()))?
    {
        let entry = entry.context("Failed to read directory entry")?;
        let file_type = entry.file_type().context("Failed to get file type")?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if file_type.is_dir() {
            std::fs::create_dir_all(&dst_path)
                .with_context(|| format!("Failed to create directory: {}", dst_path.display()))?;
            copy_dir_contents(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path).with_context(|| {
                format!(
                    "Failed to copy file from {} to {}",
                    src_path.display(),
                    dst_path.display()
                )
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_syncs_selected_skills_recursively() {
        let library = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let pdf = library.path().join("pdf");
        std::fs::create_dir_all(pdf.join("scripts")).unwrap();
        std::fs::write(pdf.join("SKILL.md"), "# PDF").unwrap();
        std::fs::write(pdf.join("scripts").join("extract.py"), "print()").unwrap();
        std::fs::create_dir_all(library.path().join("unused")).unwrap();

        let sync = DirectorySkillSync::new(library.path());
        sync.sync("s1", &["pdf".to_string()], workdir.path())
            .await
            .unwrap();

        let skills = workdir.path().join(".claude").join("skills");
        assert!(skills.join("pdf").join("SKILL.md").exists());
        assert!(skills.join("pdf").join("scripts").join("extract.py").exists());
        assert!(!skills.join("unused").exists());
    }

    #[tokio::test]
    async fn test_missing_and_invalid_skills_are_skipped() {
        let library = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let sync = DirectorySkillSync::new(library.path());

        sync.sync(
            "s1",
            &["ghost".to_string(), "../escape".to_string()],
            workdir.path(),
        )
        .await
        .unwrap();

        let skills = workdir.path().join(".claude").join("skills");
        assert!(!skills.join("ghost").exists());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "current_thread")]
    async fn test_sync_leaves_the_runtime_thread_free() {
        let library = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let skill = library.path().join("slow");
        std::fs::create_dir_all(&skill).unwrap();
        let pipe = skill.join("feed");
        let status = std::process::Command::new("mkfifo")
            .arg(&pipe)
            .status()
            .unwrap();
        assert!(status.success());

        // Opening a named pipe for reading blocks until a writer shows up
        let sync = DirectorySkillSync::new(library.path());
        let target = workdir.path().to_path_buf();
        let task = tokio::spawn(async move { sync.sync("s1", &["slow".to_string()], &target).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        let writer = tokio::task::spawn_blocking(move || std::fs::write(&pipe, b"x"));
        let finished = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert!(finished.is_ok(), "skill sync never finished");
        let _ = writer.await;
    }
}
