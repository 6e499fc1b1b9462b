//! OS adapter contract and the local-filesystem implementation.
//!
//! Capabilities are declared with a concurrency descriptor; the executor
//! must not exceed an adapter's declared concurrency. Mail and PDF
//! rendering are host-specific: the local adapter implements file
//! operations for real and reports mail/PDF as unavailable, which the
//! executor turns into `OS_CAPABILITY_MISS`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ErrorCode, StepError};
use crate::manifest::Capability;

use super::schema::ScreenSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CapabilityDescriptor {
    pub available: bool,
    pub concurrency: u32,
}

impl CapabilityDescriptor {
    pub fn available(concurrency: u32) -> Self {
        CapabilityDescriptor {
            available: true,
            concurrency,
        }
    }

    pub fn unavailable() -> Self {
        CapabilityDescriptor {
            available: false,
            concurrency: 0,
        }
    }
}

/// A missing host permission, surfaced by `check_permissions`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PermissionIssue {
    pub capability: Capability,
    pub detail: String,
}

#[async_trait]
pub trait OsAdapter: Send + Sync {
    fn capabilities(&self) -> BTreeMap<Capability, CapabilityDescriptor>;

    /// Host permission problems. With `PERMISSIONS_STRICT` these block
    /// execution; otherwise they are logged as warnings.
    async fn check_permissions(&self) -> Vec<PermissionIssue>;

    async fn take_screenshot(&self, path: &Path) -> Result<(), StepError>;
    async fn capture_screen_schema(&self, target: &str) -> Result<ScreenSchema, StepError>;

    async fn find_files(
        &self,
        query: &str,
        roots: &[String],
        limit: usize,
    ) -> Result<Vec<String>, StepError>;
    async fn move_files(
        &self,
        paths: &[String],
        dest: &str,
        newnames: Option<&[String]>,
    ) -> Result<Vec<String>, StepError>;
    async fn create_dir(&self, path: &str) -> Result<(), StepError>;
    async fn zip_folder(&self, folder: &str, out: &str) -> Result<String, StepError>;
    async fn file_exists(&self, path: &str) -> bool;

    async fn pdf_merge(&self, inputs: &[String], out: &str) -> Result<u32, StepError>;
    async fn pdf_extract_pages(
        &self,
        path: &str,
        ranges: &str,
        out: &str,
    ) -> Result<u32, StepError>;
    async fn pdf_page_count(&self, path: &str) -> Result<u32, StepError>;

    async fn compose_mail(
        &self,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> Result<String, StepError>;
    async fn attach_files(&self, draft_id: &str, files: &[String]) -> Result<(), StepError>;
    async fn save_draft(&self, draft_id: &str) -> Result<(), StepError>;
}

fn capability_miss(capability: Capability) -> StepError {
    StepError::new(
        ErrorCode::OsCapabilityMiss,
        format!("capability {capability:?} is not available on this host"),
    )
    .with_hint("declare a fallback for this step or run on a host with the capability")
}

/// Adapter backed by the local filesystem. File and archive operations
/// are real; screen, PDF, and mail operations need host integrations and
/// are reported unavailable here.
pub struct LocalOsAdapter;

impl LocalOsAdapter {
    pub fn new() -> Self {
        LocalOsAdapter
    }
}

impl Default for LocalOsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Match a `*`-glob query against a file name, case-insensitively.
pub fn glob_matches(query: &str, name: &str) -> bool {
    fn inner(q: &[char], n: &[char]) -> bool {
        match (q.first(), n.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&q[1..], n) || (!n.is_empty() && inner(q, &n[1..]))
            }
            (Some(qc), Some(nc)) => {
                qc.eq_ignore_ascii_case(nc) && inner(&q[1..], &n[1..])
            }
            _ => false,
        }
    }
    let q: Vec<char> = query.to_lowercase().chars().collect();
    let n: Vec<char> = name.to_lowercase().chars().collect();
    inner(&q, &n)
}

fn walk(dir: &Path, query: &str, limit: usize, out: &mut Vec<String>) -> std::io::Result<()> {
    if out.len() >= limit {
        return Ok(());
    }
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(Result::ok).collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        if out.len() >= limit {
            break;
        }
        let path = entry.path();
        if path.is_dir() {
            let _ = walk(&path, query, limit, out);
        } else if glob_matches(query, &entry.file_name().to_string_lossy()) {
            out.push(path.to_string_lossy().into_owned());
        }
    }
    Ok(())
}

#[async_trait]
impl OsAdapter for LocalOsAdapter {
    fn capabilities(&self) -> BTreeMap<Capability, CapabilityDescriptor> {
        let mut caps = BTreeMap::new();
        caps.insert(Capability::Fs, CapabilityDescriptor::available(4));
        caps.insert(Capability::Pdf, CapabilityDescriptor::unavailable());
        caps.insert(Capability::MailDraft, CapabilityDescriptor::unavailable());
        caps.insert(Capability::Webx, CapabilityDescriptor::unavailable());
        caps
    }

    async fn check_permissions(&self) -> Vec<PermissionIssue> {
        Vec::new()
    }

    async fn take_screenshot(&self, _path: &Path) -> Result<(), StepError> {
        Err(capability_miss(Capability::Webx))
    }

    async fn capture_screen_schema(&self, _target: &str) -> Result<ScreenSchema, StepError> {
        Err(capability_miss(Capability::Webx))
    }

    async fn find_files(
        &self,
        query: &str,
        roots: &[String],
        limit: usize,
    ) -> Result<Vec<String>, StepError> {
        let query = query.to_string();
        let roots = roots.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for root in &roots {
                let _ = walk(Path::new(root), &query, limit, &mut out);
            }
            out
        })
        .await
        .map_err(|e| StepError::new(ErrorCode::Internal, e.to_string()))
    }

    async fn move_files(
        &self,
        paths: &[String],
        dest: &str,
        newnames: Option<&[String]>,
    ) -> Result<Vec<String>, StepError> {
        let dest_dir = PathBuf::from(dest);
        if !dest_dir.is_dir() {
            return Err(StepError::new(
                ErrorCode::FileNotFound,
                format!("destination directory does not exist: {dest}"),
            )
            .with_hint("create the destination directory"));
        }
        let mut moved = Vec::with_capacity(paths.len());
        for (i, source) in paths.iter().enumerate() {
            let name = match newnames.and_then(|n| n.get(i)) {
                Some(newname) => newname.clone(),
                None => Path::new(source)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        StepError::new(ErrorCode::FileNotFound, format!("bad source path: {source}"))
                    })?,
            };
            let target = dest_dir.join(name);
            tokio::fs::rename(source, &target).await.map_err(|e| {
                StepError::new(ErrorCode::FileNotFound, format!("move {source} failed: {e}"))
            })?;
            moved.push(target.to_string_lossy().into_owned());
        }
        Ok(moved)
    }

    async fn create_dir(&self, path: &str) -> Result<(), StepError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| StepError::new(ErrorCode::Internal, format!("mkdir {path}: {e}")))
    }

    async fn zip_folder(&self, _folder: &str, _out: &str) -> Result<String, StepError> {
        Err(capability_miss(Capability::Fs))
    }

    async fn file_exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn pdf_merge(&self, _inputs: &[String], _out: &str) -> Result<u32, StepError> {
        Err(capability_miss(Capability::Pdf))
    }

    async fn pdf_extract_pages(
        &self,
        _path: &str,
        _ranges: &str,
        _out: &str,
    ) -> Result<u32, StepError> {
        Err(capability_miss(Capability::Pdf))
    }

    async fn pdf_page_count(&self, _path: &str) -> Result<u32, StepError> {
        Err(capability_miss(Capability::Pdf))
    }

    async fn compose_mail(
        &self,
        _to: &[String],
        _subject: &str,
        _body: &str,
    ) -> Result<String, StepError> {
        Err(capability_miss(Capability::MailDraft))
    }

    async fn attach_files(&self, _draft_id: &str, _files: &[String]) -> Result<(), StepError> {
        Err(capability_miss(Capability::MailDraft))
    }

    async fn save_draft(&self, _draft_id: &str) -> Result<(), StepError> {
        Err(capability_miss(Capability::MailDraft))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_matching() {
        assert!(glob_matches("*.pdf", "report.pdf"));
        assert!(glob_matches("*.pdf", "REPORT.PDF"));
        assert!(!glob_matches("*.pdf", "report.pdf.bak"));
        assert!(glob_matches("inv*2025*.csv", "invoice_2025_07.csv"));
        assert!(glob_matches("*", "anything"));
    }

    #[tokio::test]
    async fn test_find_files_respects_limit_and_query() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("doc_{i}.pdf")), b"x").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let adapter = LocalOsAdapter::new();
        let found = adapter
            .find_files("*.pdf", &[dir.path().to_string_lossy().into_owned()], 3)
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|p| p.ends_with(".pdf")));
    }

    #[tokio::test]
    async fn test_move_files_requires_existing_dest() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"x").unwrap();

        let adapter = LocalOsAdapter::new();
        let missing = dir.path().join("out");
        let err = adapter
            .move_files(
                &[src.to_string_lossy().into_owned()],
                &missing.to_string_lossy(),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileNotFound);

        adapter
            .create_dir(&missing.to_string_lossy())
            .await
            .unwrap();
        let moved = adapter
            .move_files(
                &[src.to_string_lossy().into_owned()],
                &missing.to_string_lossy(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert!(missing.join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_unavailable_capability_reports_miss() {
        let adapter = LocalOsAdapter::new();
        let err = adapter.pdf_merge(&[], "out.pdf").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::OsCapabilityMiss);
        assert!(!adapter.capabilities()[&Capability::Pdf].available);
    }
}
