use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

/// What output collection produced for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputReport {
    /// Files handed to the sandbox store.
    pub files: Vec<PathBuf>,
    /// Patterns that matched nothing, or directories that failed to archive.
    pub missing: Vec<String>,
    /// Total bytes of `files`.
    pub size: u64,
}

/// Expand output sandbox patterns under `base`.
///
/// Wildcards are expanded, regular files are taken as they are and
/// directories are archived next to themselves as `<dir>.tar`.
pub async fn resolve_output_files(base: &Path, patterns: &[String]) -> OutputReport {
    let mut report = OutputReport::default();

    for pattern in patterns {
        let full = if Path::new(pattern).is_absolute() {
            PathBuf::from(pattern)
        } else {
            base.join(pattern)
        };

        let matches: Vec<PathBuf> = match glob::glob(&full.to_string_lossy()) {
            Ok(paths) => paths.filter_map(Result::ok).collect(),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Invalid output sandbox pattern");
                Vec::new()
            }
        };
        if matches.is_empty() {
            report.missing.push(pattern.clone());
            continue;
        }

        for path in matches {
            if path.is_file() {
                push_file(&mut report, path);
            } else if path.is_dir() {
                match archive_dir(&path).await {
                    Ok(archive) => push_file(&mut report, archive),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Could not archive output directory");
                        report.missing.push(path.display().to_string());
                    }
                }
            }
        }
    }

    report
}

fn push_file(report: &mut OutputReport, path: PathBuf) {
    if report.files.contains(&path) {
        return;
    }
    report.size += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    report.files.push(path);
}

/// `tar cf <dir>.tar -C <parent> <dir name>`.
async fn archive_dir(dir: &Path) -> std::io::Result<PathBuf> {
    let name = dir
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no directory name"))?;
    let parent = dir.parent().unwrap_or_else(|| Path::new("."));
    let archive = dir.with_file_name(format!("{}.tar", name.to_string_lossy()));

    let status = Command::new("tar")
        .arg("cf")
        .arg(&archive)
        .arg("-C")
        .arg(parent)
        .arg(name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .status()
        .await?;
    if !status.success() {
        return Err(std::io::Error::other(format!("tar exited with {}", status)));
    }
    Ok(archive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wildcards_and_missing_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("part-00000"), "a\t1\n").unwrap();
        std::fs::write(dir.path().join("part-00001"), "b\t2\n").unwrap();

        let report = resolve_output_files(
            dir.path(),
            &["part-*".to_string(), "std.err".to_string()],
        )
        .await;
        assert_eq!(report.files.len(), 2);
        assert_eq!(report.missing, vec!["std.err".to_string()]);
        assert_eq!(report.size, 8);
    }

    #[tokio::test]
    async fn directories_are_archived() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("wordcount_42");
        std::fs::create_dir(&out).unwrap();
        std::fs::write(out.join("part-00000"), "x").unwrap();

        let report = resolve_output_files(dir.path(), &["wordcount_42".to_string()]).await;
        assert!(report.missing.is_empty());
        assert_eq!(report.files, vec![dir.path().join("wordcount_42.tar")]);
        assert!(report.files[0].is_file());
    }

    #[tokio::test]
    async fn duplicate_matches_are_uploaded_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("log"), "x").unwrap();
        let report =
            resolve_output_files(dir.path(), &["log".to_string(), "l*".to_string()]).await;
        assert_eq!(report.files.len(), 1);
    }
}
