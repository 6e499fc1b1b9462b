//! Deterministic fake adapters for tests and dry runs.
//!
//! The fake OS adapter keeps an in-memory file tree with per-file PDF
//! page counts; the fake web engine serves a scripted DOM schema and can
//! defer an element's appearance to exercise verifier retries.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{ErrorCode, StepError};
use crate::manifest::Capability;

use super::os::{glob_matches, CapabilityDescriptor, OsAdapter, PermissionIssue};
use super::schema::{ScreenSchema, SchemaElement};
use super::web::{ElementTarget, WebEngine};

#[derive(Debug, Clone, Default)]
struct FakeFile {
    pdf_pages: Option<u32>,
}

#[derive(Default)]
struct FakeFsState {
    files: BTreeMap<String, FakeFile>,
    dirs: BTreeSet<String>,
    drafts: Vec<FakeDraft>,
    screenshots: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FakeDraft {
    pub draft_id: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<String>,
    pub saved: bool,
}

pub struct FakeOsAdapter {
    state: Mutex<FakeFsState>,
    screen_schema: Mutex<ScreenSchema>,
    permission_issues: Mutex<Vec<PermissionIssue>>,
}

impl FakeOsAdapter {
    pub fn new() -> Self {
        FakeOsAdapter {
            state: Mutex::new(FakeFsState::default()),
            screen_schema: Mutex::new(ScreenSchema::default()),
            permission_issues: Mutex::new(Vec::new()),
        }
    }

    pub fn add_file(&self, path: &str) {
        self.state
            .lock()
            .files
            .insert(path.to_string(), FakeFile::default());
    }

    pub fn add_pdf(&self, path: &str, pages: u32) {
        self.state.lock().files.insert(
            path.to_string(),
            FakeFile {
                pdf_pages: Some(pages),
            },
        );
    }

    pub fn add_dir(&self, path: &str) {
        self.state.lock().dirs.insert(path.trim_end_matches('/').to_string());
    }

    pub fn set_screen_schema(&self, schema: ScreenSchema) {
        *self.screen_schema.lock() = schema;
    }

    pub fn set_permission_issues(&self, issues: Vec<PermissionIssue>) {
        *self.permission_issues.lock() = issues;
    }

    pub fn drafts(&self) -> Vec<FakeDraft> {
        self.state.lock().drafts.clone()
    }

    pub fn screenshots(&self) -> Vec<String> {
        self.state.lock().screenshots.clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.state.lock().files.keys().cloned().collect()
    }

    fn parent_dir(path: &str) -> String {
        Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl Default for FakeOsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OsAdapter for FakeOsAdapter {
    fn capabilities(&self) -> BTreeMap<Capability, CapabilityDescriptor> {
        let mut caps = BTreeMap::new();
        caps.insert(Capability::Fs, CapabilityDescriptor::available(4));
        caps.insert(Capability::Pdf, CapabilityDescriptor::available(2));
        caps.insert(Capability::MailDraft, CapabilityDescriptor::available(1));
        caps.insert(Capability::Webx, CapabilityDescriptor::available(1));
        caps
    }

    async fn check_permissions(&self) -> Vec<PermissionIssue> {
        self.permission_issues.lock().clone()
    }

    async fn take_screenshot(&self, path: &Path) -> Result<(), StepError> {
        self.state
            .lock()
            .screenshots
            .push(path.to_string_lossy().into_owned());
        Ok(())
    }

    async fn capture_screen_schema(&self, _target: &str) -> Result<ScreenSchema, StepError> {
        Ok(self.screen_schema.lock().clone())
    }

    async fn find_files(
        &self,
        query: &str,
        roots: &[String],
        limit: usize,
    ) -> Result<Vec<String>, StepError> {
        let state = self.state.lock();
        let mut found = Vec::new();
        for path in state.files.keys() {
            if found.len() >= limit {
                break;
            }
            let in_root = roots.iter().any(|root| {
                let root = root.trim_end_matches('/');
                path.starts_with(&format!("{root}/"))
            });
            let name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if in_root && glob_matches(query, &name) {
                found.push(path.clone());
            }
        }
        Ok(found)
    }

    async fn move_files(
        &self,
        paths: &[String],
        dest: &str,
        newnames: Option<&[String]>,
    ) -> Result<Vec<String>, StepError> {
        let mut state = self.state.lock();
        let dest = dest.trim_end_matches('/');
        if !state.dirs.contains(dest) {
            return Err(StepError::new(
                ErrorCode::FileNotFound,
                format!("destination directory does not exist: {dest}"),
            ));
        }
        let mut moved = Vec::with_capacity(paths.len());
        for (i, source) in paths.iter().enumerate() {
            let file = state.files.remove(source).ok_or_else(|| {
                StepError::new(ErrorCode::FileNotFound, format!("no such file: {source}"))
            })?;
            let name = match newnames.and_then(|n| n.get(i)) {
                Some(newname) => newname.clone(),
                None => Path::new(source)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            };
            let target = format!("{dest}/{name}");
            state.files.insert(target.clone(), file);
            moved.push(target);
        }
        Ok(moved)
    }

    async fn create_dir(&self, path: &str) -> Result<(), StepError> {
        self.add_dir(path);
        Ok(())
    }

    async fn zip_folder(&self, folder: &str, out: &str) -> Result<String, StepError> {
        let mut state = self.state.lock();
        let members = state
            .files
            .keys()
            .filter(|p| p.starts_with(&format!("{}/", folder.trim_end_matches('/'))))
            .count();
        if members == 0 {
            return Err(StepError::new(
                ErrorCode::FileNotFound,
                format!("folder is empty or missing: {folder}"),
            ));
        }
        state.files.insert(out.to_string(), FakeFile::default());
        Ok(out.to_string())
    }

    async fn file_exists(&self, path: &str) -> bool {
        self.state.lock().files.contains_key(path)
    }

    async fn pdf_merge(&self, inputs: &[String], out: &str) -> Result<u32, StepError> {
        let mut state = self.state.lock();
        let mut pages = 0;
        for input in inputs {
            let file = state.files.get(input).ok_or_else(|| {
                StepError::new(ErrorCode::FileNotFound, format!("no such file: {input}"))
            })?;
            pages += file.pdf_pages.ok_or_else(|| {
                StepError::new(ErrorCode::PdfParseError, format!("not a PDF: {input}"))
            })?;
        }
        state.files.insert(
            out.to_string(),
            FakeFile {
                pdf_pages: Some(pages),
            },
        );
        Ok(pages)
    }

    async fn pdf_extract_pages(
        &self,
        path: &str,
        ranges: &str,
        out: &str,
    ) -> Result<u32, StepError> {
        let mut state = self.state.lock();
        let source_pages = state
            .files
            .get(path)
            .and_then(|f| f.pdf_pages)
            .ok_or_else(|| {
                StepError::new(ErrorCode::PdfParseError, format!("not a PDF: {path}"))
            })?;
        let extracted = parse_page_ranges(ranges, source_pages)?;
        state.files.insert(
            out.to_string(),
            FakeFile {
                pdf_pages: Some(extracted),
            },
        );
        Ok(extracted)
    }

    async fn pdf_page_count(&self, path: &str) -> Result<u32, StepError> {
        let state = self.state.lock();
        let file = state.files.get(path).ok_or_else(|| {
            StepError::new(ErrorCode::FileNotFound, format!("no such file: {path}"))
        })?;
        file.pdf_pages
            .ok_or_else(|| StepError::new(ErrorCode::PdfParseError, format!("not a PDF: {path}")))
    }

    async fn compose_mail(
        &self,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> Result<String, StepError> {
        let mut state = self.state.lock();
        let draft_id = format!("draft-{}", state.drafts.len() + 1);
        state.drafts.push(FakeDraft {
            draft_id: draft_id.clone(),
            to: to.to_vec(),
            subject: subject.to_string(),
            body: body.to_string(),
            attachments: Vec::new(),
            saved: false,
        });
        Ok(draft_id)
    }

    async fn attach_files(&self, draft_id: &str, files: &[String]) -> Result<(), StepError> {
        let mut state = self.state.lock();
        let draft = state
            .drafts
            .iter_mut()
            .find(|d| d.draft_id == draft_id)
            .ok_or_else(|| {
                StepError::new(ErrorCode::Internal, format!("unknown draft: {draft_id}"))
            })?;
        draft.attachments.extend(files.iter().cloned());
        Ok(())
    }

    async fn save_draft(&self, draft_id: &str) -> Result<(), StepError> {
        let mut state = self.state.lock();
        let draft = state
            .drafts
            .iter_mut()
            .find(|d| d.draft_id == draft_id)
            .ok_or_else(|| {
                StepError::new(ErrorCode::Internal, format!("unknown draft: {draft_id}"))
            })?;
        draft.saved = true;
        Ok(())
    }
}

/// `"1-3,7"` → page count, bounded by the source document.
fn parse_page_ranges(ranges: &str, source_pages: u32) -> Result<u32, StepError> {
    let mut total = 0u32;
    for part in ranges.split(',') {
        let part = part.trim();
        let count = match part.split_once('-') {
            Some((from, to)) => {
                let from: u32 = from.trim().parse().map_err(|_| bad_range(ranges))?;
                let to: u32 = to.trim().parse().map_err(|_| bad_range(ranges))?;
                if from == 0 || to < from || to > source_pages {
                    return Err(bad_range(ranges));
                }
                to - from + 1
            }
            None => {
                let page: u32 = part.parse().map_err(|_| bad_range(ranges))?;
                if page == 0 || page > source_pages {
                    return Err(bad_range(ranges));
                }
                1
            }
        };
        total += count;
    }
    Ok(total)
}

fn bad_range(ranges: &str) -> StepError {
    StepError::new(ErrorCode::PdfParseError, format!("invalid page ranges: {ranges}"))
}

// ---------------------------------------------------------------------
// Fake web engine
// ---------------------------------------------------------------------

#[derive(Default)]
struct FakeWebState {
    current_url: Option<String>,
    elements: Vec<SchemaElement>,
    /// (element, visible starting at capture/interaction N).
    deferred: Vec<(SchemaElement, u32)>,
    observations: u32,
    clicks: Vec<String>,
    fills: Vec<(String, String)>,
    uploads: Vec<String>,
    downloads: Vec<String>,
    fail_uploads: u32,
    download_bytes: Option<u64>,
}

pub struct FakeWebEngine {
    state: Mutex<FakeWebState>,
}

impl FakeWebEngine {
    pub fn new() -> Self {
        FakeWebEngine {
            state: Mutex::new(FakeWebState::default()),
        }
    }

    pub fn add_element(&self, element: SchemaElement) {
        self.state.lock().elements.push(element);
    }

    /// Element becomes visible only from the Nth observation on
    /// (1-based): lets tests stage late-appearing elements.
    pub fn add_deferred_element(&self, element: SchemaElement, visible_from: u32) {
        self.state.lock().deferred.push((element, visible_from));
    }

    /// Make the next `n` uploads fail with `WEB_UPLOAD_FAILED`.
    pub fn fail_next_uploads(&self, n: u32) {
        self.state.lock().fail_uploads = n;
    }

    pub fn set_download_bytes(&self, bytes: u64) {
        self.state.lock().download_bytes = Some(bytes);
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state.lock().clicks.clone()
    }

    pub fn fills(&self) -> Vec<(String, String)> {
        self.state.lock().fills.clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state.lock().uploads.clone()
    }

    fn observe(state: &mut FakeWebState) -> Vec<SchemaElement> {
        state.observations += 1;
        let tick = state.observations;
        let mut visible = state.elements.clone();
        visible.extend(
            state
                .deferred
                .iter()
                .filter(|(_, from)| tick >= *from)
                .map(|(e, _)| e.clone()),
        );
        visible
    }
}

impl Default for FakeWebEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebEngine for FakeWebEngine {
    async fn open(&self, url: &str, _context: &str) -> Result<(), StepError> {
        self.state.lock().current_url = Some(url.to_string());
        Ok(())
    }

    async fn fill(&self, target: &ElementTarget, text: &str) -> Result<(), StepError> {
        let mut state = self.state.lock();
        let visible = Self::observe(&mut state);
        // Selector addressing reaches placeholder/aria facets; label
        // addressing matches only the label and visible text, the way a
        // label-based engine lookup behaves.
        if let Some(selector) = target.selector.as_deref() {
            let found = visible.iter().any(|e| {
                e.placeholder.as_deref() == Some(selector)
                    || e.aria_label.as_deref() == Some(selector)
            });
            if !found {
                return Err(StepError::new(
                    ErrorCode::WebElementNotFound,
                    format!("no element for selector '{selector}'"),
                ));
            }
            state.fills.push((selector.to_string(), text.to_string()));
            return Ok(());
        }
        let label = target.label.as_deref().or(target.text.as_deref()).unwrap_or_default();
        let found = visible.iter().any(|e| {
            let label_hit = e
                .label
                .as_deref()
                .map(|l| l.contains(label))
                .unwrap_or(false)
                || (!e.text.is_empty() && e.text.contains(label));
            let role_hit = target
                .role
                .as_deref()
                .map(|r| e.role.eq_ignore_ascii_case(r))
                .unwrap_or(true);
            label_hit && role_hit
        });
        if !found {
            return Err(StepError::new(
                ErrorCode::WebElementNotFound,
                format!("no element matching label '{label}'"),
            ));
        }
        state.fills.push((label.to_string(), text.to_string()));
        Ok(())
    }

    async fn click(&self, target: &ElementTarget) -> Result<(), StepError> {
        let mut state = self.state.lock();
        let visible = Self::observe(&mut state);
        let text = target.text.as_deref().unwrap_or_default();
        let found = visible
            .iter()
            .any(|e| e.matches(Some(text), target.role.as_deref()));
        if !found {
            return Err(StepError::new(
                ErrorCode::WebElementNotFound,
                format!("no element with text '{text}'"),
            ));
        }
        state.clicks.push(text.to_string());
        Ok(())
    }

    async fn upload(&self, _target: &ElementTarget, path: &str) -> Result<(), StepError> {
        let mut state = self.state.lock();
        if state.fail_uploads > 0 {
            state.fail_uploads -= 1;
            return Err(StepError::new(
                ErrorCode::WebUploadFailed,
                format!("upload of {path} failed"),
            ));
        }
        state.uploads.push(path.to_string());
        Ok(())
    }

    async fn download(&self, url: &str, to: &str) -> Result<(), StepError> {
        let mut state = self.state.lock();
        state.downloads.push(format!("{url} -> {to}"));
        Ok(())
    }

    async fn wait_for_download(&self, to: &str, _timeout_ms: u64) -> Result<u64, StepError> {
        let state = self.state.lock();
        match state.download_bytes {
            Some(bytes) => Ok(bytes),
            None => Err(StepError::new(
                ErrorCode::DownloadTimeout,
                format!("no download arrived at {to}"),
            )),
        }
    }

    async fn capture_dom_schema(&self, _target: &str) -> Result<ScreenSchema, StepError> {
        let mut state = self.state.lock();
        let elements = Self::observe(&mut state);
        Ok(ScreenSchema {
            source: state.current_url.clone().unwrap_or_else(|| "web".to_string()),
            elements,
        })
    }

    async fn current_url(&self) -> Option<String> {
        self.state.lock().current_url.clone()
    }

    async fn cookies_get(&self, _domain: &str) -> Result<Value, StepError> {
        Ok(Value::Array(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_fs_find_and_move() {
        let os = FakeOsAdapter::new();
        os.add_pdf("./in/a.pdf", 3);
        os.add_pdf("./in/b.pdf", 2);
        os.add_file("./in/readme.txt");

        let found = os.find_files("*.pdf", &["./in".to_string()], 10).await.unwrap();
        assert_eq!(found.len(), 2);

        os.add_dir("./out");
        let moved = os.move_files(&found, "./out", None).await.unwrap();
        assert!(moved.iter().all(|p| p.starts_with("./out/")));
        assert!(os.file_exists("./out/a.pdf").await);
    }

    #[tokio::test]
    async fn test_fake_pdf_merge_sums_pages() {
        let os = FakeOsAdapter::new();
        os.add_pdf("a.pdf", 3);
        os.add_pdf("b.pdf", 4);
        let pages = os
            .pdf_merge(&["a.pdf".into(), "b.pdf".into()], "out.pdf")
            .await
            .unwrap();
        assert_eq!(pages, 7);
        assert_eq!(os.pdf_page_count("out.pdf").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_fake_pdf_extract_ranges() {
        let os = FakeOsAdapter::new();
        os.add_pdf("a.pdf", 10);
        assert_eq!(os.pdf_extract_pages("a.pdf", "1-3,7", "out.pdf").await.unwrap(), 4);
        assert!(os.pdf_extract_pages("a.pdf", "9-12", "out.pdf").await.is_err());
    }

    #[tokio::test]
    async fn test_fake_mail_flow() {
        let os = FakeOsAdapter::new();
        let draft = os
            .compose_mail(&["a@b".into()], "Weekly", "report attached")
            .await
            .unwrap();
        os.attach_files(&draft, &["out.pdf".into()]).await.unwrap();
        os.save_draft(&draft).await.unwrap();

        let drafts = os.drafts();
        assert_eq!(drafts.len(), 1);
        assert!(drafts[0].saved);
        assert_eq!(drafts[0].attachments, vec!["out.pdf"]);
    }

    #[tokio::test]
    async fn test_fake_web_click_and_deferred_element() {
        let web = FakeWebEngine::new();
        web.add_element(SchemaElement::button("確定"));
        web.add_deferred_element(SchemaElement::button("送信"), 3);

        let err = web
            .click(&ElementTarget::by_text("送信", Some("button")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::WebElementNotFound);

        // Second observation still hidden, third shows it.
        assert!(web.click(&ElementTarget::by_text("送信", None)).await.is_err());
        assert!(web.click(&ElementTarget::by_text("送信", None)).await.is_ok());
        assert_eq!(web.clicks(), vec!["送信"]);
    }

    #[tokio::test]
    async fn test_fake_web_upload_failures() {
        let web = FakeWebEngine::new();
        web.fail_next_uploads(1);
        assert!(web
            .upload(&ElementTarget::by_label("file"), "a.pdf")
            .await
            .is_err());
        assert!(web
            .upload(&ElementTarget::by_label("file"), "a.pdf")
            .await
            .is_ok());
        assert_eq!(web.uploads(), vec!["a.pdf"]);
    }
}
