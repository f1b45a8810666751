//! Artifact capture from agent git metadata.
//!
//! When an agent run reports changed files, every markdown file becomes
//! an artifact: the type and title are inferred from the filename, and
//! the content comes from the agent's delivered payload when present,
//! else from a shallow clone of the committed branch.

use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Inferred artifact classification for a changed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferredArtifact {
    /// Artifact type, e.g. `prd`, `spec`, `plan`, `review_report`.
    pub artifact_type: String,
    /// Display title derived from the file stem.
    pub title: String,
}

/// Returns true when the path names a markdown document.
#[must_use]
pub fn is_markdown(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.ends_with(".md") || lower.ends_with(".markdown")
}

/// Infers `(type, title)` from a markdown filename.
#[must_use]
pub fn infer_artifact(path: &str) -> InferredArtifact {
    let stem = Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    let lower = stem.to_lowercase();

    let artifact_type = if lower.contains("prd") {
        "prd"
    } else if lower.contains("spec") {
        "spec"
    } else if lower.contains("plan") {
        "plan"
    } else if lower.contains("review") {
        "review_report"
    } else if lower.contains("report") {
        "report"
    } else {
        "doc"
    };

    InferredArtifact {
        artifact_type: artifact_type.to_string(),
        title: stem.replace(['-', '_'], " "),
    }
}

/// Picks the artifact content out of the agent's delivered output, when
/// the output carries a string field matching the artifact type.
#[must_use]
pub fn delivered_content<'a>(
    output: &'a serde_json::Map<String, serde_json::Value>,
    artifact_type: &str,
) -> Option<&'a str> {
    let keys: &[&str] = match artifact_type {
        "review_report" => &["report", "review"],
        other => &[other, "content"],
    };
    // Fallback keys shared by every type.
    keys.iter()
        .chain(["result"].iter())
        .find_map(|key| output.get(*key).and_then(serde_json::Value::as_str))
}

/// Fetches one file from a repository at a branch via a shallow clone.
/// Best-effort: any git failure yields `None`.
pub async fn fetch_file_from_repo(repo_url: &str, branch: &str, path: &str) -> Option<String> {
    if repo_url.is_empty() || branch.is_empty() {
        return None;
    }

    let scratch = tempfile::tempdir().ok()?;
    let checkout = scratch.path().join("repo");

    let clone = Command::new("git")
        .arg("clone")
        .arg("--depth")
        .arg("1")
        .arg("--branch")
        .arg(branch)
        .arg(repo_url)
        .arg(&checkout)
        .output()
        .await
        .ok()?;
    if !clone.status.success() {
        debug!(
            branch,
            stderr = %String::from_utf8_lossy(&clone.stderr),
            "shallow clone for artifact content failed"
        );
        return None;
    }

    let show = Command::new("git")
        .arg("-C")
        .arg(&checkout)
        .arg("show")
        .arg(format!("HEAD:{path}"))
        .output()
        .await
        .ok()?;
    if !show.status.success() {
        return None;
    }

    Some(String::from_utf8_lossy(&show.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn markdown_detection() {
        assert!(is_markdown("docs/plan.md"));
        assert!(is_markdown("REVIEW.MARKDOWN"));
        assert!(!is_markdown("src/main.rs"));
        assert!(!is_markdown("README"));
    }

    #[test]
    fn infers_type_from_filename() {
        assert_eq!(infer_artifact("docs/product-prd.md").artifact_type, "prd");
        assert_eq!(infer_artifact("SPEC.md").artifact_type, "spec");
        assert_eq!(infer_artifact("plan.md").artifact_type, "plan");
        assert_eq!(
            infer_artifact("code-review.md").artifact_type,
            "review_report"
        );
        assert_eq!(infer_artifact("test_report.md").artifact_type, "report");
        assert_eq!(infer_artifact("notes.md").artifact_type, "doc");
    }

    #[test]
    fn title_from_stem() {
        assert_eq!(infer_artifact("docs/launch-plan.md").title, "launch plan");
        assert_eq!(infer_artifact("test_report.md").title, "test report");
    }

    #[test]
    fn delivered_content_matches_type() {
        let output = json!({"plan": "step one", "summary": "did it"})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(delivered_content(&output, "plan"), Some("step one"));
        assert_eq!(delivered_content(&output, "spec"), None);
    }

    #[test]
    fn delivered_content_review_report_aliases() {
        let output = json!({"report": "looks good"}).as_object().cloned().unwrap();
        assert_eq!(
            delivered_content(&output, "review_report"),
            Some("looks good")
        );
    }
}
