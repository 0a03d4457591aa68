use axum::body::Bytes;
use image::ImageFormat;
use serde::Serialize;
use std::{fmt, io, path::{Path, PathBuf}};
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use crate::{config::ServiceCfg, error::{CompareError, ValidationError}};

/// Which of the two expected form parts a file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot { Image1, Image2 }

impl Slot {
    pub fn field_name(self) -> &'static str {
        match self {
            Slot::Image1 => "image1",
            Slot::Image2 => "image2",
        }
    }

    pub fn from_field(name: &str) -> Option<Self> {
        match name {
            "image1" => Some(Slot::Image1),
            "image2" => Some(Slot::Image2),
            _ => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

/// A file part as received from the client, not yet validated.
#[derive(Debug, Clone)]
pub struct UploadPart {
    pub file_name: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct CompareRequest {
    pub image1: Option<UploadPart>,
    pub image2: Option<UploadPart>,
}

impl CompareRequest {
    pub fn new(image1: UploadPart, image2: UploadPart) -> Self {
        Self { image1: Some(image1), image2: Some(image2) }
    }

    /// Stores a part under its slot. The first part for a slot wins.
    /// Returns false if the part was ignored.
    pub fn insert(&mut self, slot: Slot, part: UploadPart) -> bool {
        let entry = match slot {
            Slot::Image1 => &mut self.image1,
            Slot::Image2 => &mut self.image2,
        };
        if entry.is_some() {
            return false;
        }
        *entry = Some(part);
        true
    }
}

/// A part that passed validation and has been given its storage name.
#[derive(Debug, Clone)]
pub struct AcceptedUpload {
    pub slot: Slot,
    pub original_name: String,
    pub storage_name: String,
    pub bytes: Bytes,
}

/// An upload written to the scratch directory and verified present.
#[derive(Debug, Clone)]
pub struct StoredAsset {
    pub slot: Slot,
    pub original_name: String,
    pub path: PathBuf,
    pub size: u64,
    /// Format detected from the file's magic bytes.
    pub sniffed: Option<ImageFormat>,
    /// Format implied by the file's extension.
    pub claimed: Option<ImageFormat>,
}

impl StoredAsset {
    pub fn format_mismatch(&self) -> bool {
        matches!((self.sniffed, self.claimed), (Some(s), Some(c)) if s != c)
    }
}

pub struct UploadGateway {
    cfg: ServiceCfg,
}

impl UploadGateway {
    pub fn new(cfg: &ServiceCfg) -> Self {
        Self { cfg: cfg.clone() }
    }

    /// Checks presence, filenames, extensions and total size, in that order.
    /// Nothing touches the disk here.
    pub fn validate(&self, req: CompareRequest) -> Result<[AcceptedUpload; 2], ValidationError> {
        let (Some(p1), Some(p2)) = (req.image1, req.image2) else {
            return Err(ValidationError::MissingParts);
        };
        if p1.file_name.is_empty() || p2.file_name.is_empty() {
            return Err(ValidationError::EmptyFilename);
        }
        if !self.allowed(&p1.file_name) || !self.allowed(&p2.file_name) {
            return Err(ValidationError::InvalidFileType { allowed: self.cfg.allowed_list() });
        }
        let total = p1.bytes.len() as u64 + p2.bytes.len() as u64;
        if total > self.cfg.max_body_bytes {
            return Err(ValidationError::TooLarge { limit: self.cfg.max_body_bytes });
        }
        Ok([accept(Slot::Image1, p1), accept(Slot::Image2, p2)])
    }

    fn allowed(&self, name: &str) -> bool {
        extension(name).is_some_and(|ext| self.cfg.allows_extension(ext))
    }

    /// Writes the upload atomically (temp file then rename) and re-checks that
    /// it exists. Paths are registered with `scratch` before anything is
    /// written so they get cleaned up on every outcome.
    pub async fn persist(&self, up: AcceptedUpload, scratch: &mut ScratchSet) -> Result<StoredAsset, CompareError> {
        let dir = &self.cfg.scratch_dir;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| CompareError::storage("Failed to save uploaded images.", e))?;

        let path = dir.join(&up.storage_name);
        let tmp = dir.join(format!("{}.part", up.storage_name));
        scratch.track(tmp.clone());
        scratch.track(path.clone());

        write_atomic(&tmp, &path, &up.bytes)
            .await
            .map_err(|e| CompareError::storage("Failed to save uploaded images.", e))?;

        let missing = || io::Error::new(io::ErrorKind::NotFound, "file missing after write");
        match fs::try_exists(&path).await {
            Ok(true) => {}
            Ok(false) => return Err(CompareError::storage(format!("Failed to save {}", up.original_name), missing())),
            Err(e) => return Err(CompareError::storage(format!("Failed to save {}", up.original_name), e)),
        }

        Ok(StoredAsset {
            slot: up.slot,
            claimed: extension(&up.original_name).and_then(ImageFormat::from_extension),
            sniffed: image::guess_format(&up.bytes).ok(),
            size: up.bytes.len() as u64,
            original_name: up.original_name,
            path,
        })
    }
}

async fn write_atomic(tmp: &Path, dest: &Path, bytes: &[u8]) -> io::Result<()> {
    {
        let mut f = fs::File::create(tmp).await?;
        f.write_all(bytes).await?;
        let _ = f.sync_all().await; // best-effort
    }
    fs::rename(tmp, dest).await
}

fn accept(slot: Slot, part: UploadPart) -> AcceptedUpload {
    AcceptedUpload {
        slot,
        storage_name: format!("{}_{}", Uuid::new_v4(), sanitize_filename(&part.file_name)),
        original_name: part.file_name,
        bytes: part.bytes,
    }
}

/// Text after the last dot, if any.
pub fn extension(name: &str) -> Option<&str> {
    name.rsplit_once('.').map(|(_, ext)| ext)
}

/// Makes a client-supplied name safe to use as a single path component:
/// non-ASCII is transliterated (`café` -> `cafe`), separators become word
/// breaks, only `[A-Za-z0-9_.-]` survive, whitespace runs collapse to `_`,
/// and leading/trailing dots and underscores go.
pub fn sanitize_filename(name: &str) -> String {
    let folded = deunicode::deunicode_with_tofu(name, "");
    let spaced: String = folded.chars().map(|c| if c == '/' || c == '\\' { ' ' } else { c }).collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() { "upload".to_string() } else { trimmed.to_string() }
}

/// Tracks every scratch path a request may have created. `cleanup` removes
/// them and reports failures; if the set is dropped first (for example the
/// request future was cancelled) the remaining paths are removed in `Drop`.
#[derive(Debug, Default)]
pub struct ScratchSet {
    paths: Vec<PathBuf>,
}

impl ScratchSet {
    pub fn new() -> Self { Self::default() }

    pub fn track(&mut self, path: PathBuf) { self.paths.push(path); }

    pub fn is_empty(&self) -> bool { self.paths.is_empty() }

    /// Removes all tracked files. Paths that are already gone are not errors.
    pub async fn cleanup(&mut self) -> Vec<(PathBuf, io::Error)> {
        let mut failures = Vec::new();
        for path in self.paths.drain(..) {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => failures.push((path, e)),
            }
        }
        failures
    }
}

impl Drop for ScratchSet {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(name: &str, bytes: &'static [u8]) -> UploadPart {
        UploadPart { file_name: name.to_string(), bytes: Bytes::from_static(bytes) }
    }

    fn gateway(dir: &Path) -> UploadGateway {
        let cfg = ServiceCfg { scratch_dir: dir.to_path_buf(), ..ServiceCfg::default() };
        UploadGateway::new(&cfg)
    }

    #[test]
    fn sanitize_strips_traversal_and_unsafe_chars() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_filename("..\\windows\\evil.png"), "windows_evil.png");
        assert_eq!(sanitize_filename("my cat photo.JPG"), "my_cat_photo.JPG");
        assert_eq!(sanitize_filename("weird$%name!.gif"), "weirdname.gif");
        assert_eq!(sanitize_filename("..."), "upload");
        assert_eq!(sanitize_filename("/"), "upload");
    }

    #[test]
    fn sanitize_folds_non_ascii() {
        assert_eq!(sanitize_filename("café.png"), "cafe.png");
        assert_eq!(sanitize_filename("naïve résumé.jpg"), "naive_resume.jpg");
        assert_eq!(sanitize_filename("фото.jpg"), "foto.jpg");
        assert_eq!(extension(&sanitize_filename("Ünïcödé.GIF")), Some("GIF"));
    }

    #[test]
    fn extension_uses_last_dot() {
        assert_eq!(extension("a.tar.gz"), Some("gz"));
        assert_eq!(extension(".png"), Some("png"));
        assert_eq!(extension("png"), None);
        assert_eq!(extension("trailing."), Some(""));
    }

    #[test]
    fn first_part_per_slot_wins() {
        let mut req = CompareRequest::default();
        assert!(req.insert(Slot::Image1, part("a.png", b"1")));
        assert!(!req.insert(Slot::Image1, part("b.png", b"2")));
        assert_eq!(req.image1.unwrap().file_name, "a.png");
        assert_eq!(Slot::from_field("image2"), Some(Slot::Image2));
        assert_eq!(Slot::from_field("image3"), None);
    }

    #[test]
    fn validation_order() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());

        let missing = CompareRequest { image1: Some(part("a.png", b"x")), image2: None };
        assert_eq!(gw.validate(missing).unwrap_err(), ValidationError::MissingParts);

        // Empty name is reported before the bad extension on the other part.
        let empty = CompareRequest::new(part("", b"x"), part("b.txt", b"y"));
        assert_eq!(gw.validate(empty).unwrap_err(), ValidationError::EmptyFilename);

        let bad = CompareRequest::new(part("a.png", b"x"), part("b.txt", b"y"));
        match gw.validate(bad).unwrap_err() {
            ValidationError::InvalidFileType { allowed } => assert_eq!(allowed, "png, jpg, jpeg, gif"),
            other => panic!("unexpected: {other:?}"),
        }

        let no_ext = CompareRequest::new(part("png", b"x"), part("b.png", b"y"));
        assert!(matches!(gw.validate(no_ext), Err(ValidationError::InvalidFileType { .. })));
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        let req = CompareRequest::new(part("A.PNG", b"x"), part("b.JpEg", b"y"));
        let [a, b] = gw.validate(req).unwrap();
        assert_eq!(a.slot, Slot::Image1);
        assert_eq!(b.slot, Slot::Image2);
        assert!(a.storage_name.ends_with("_A.PNG"));
        assert_ne!(a.storage_name, b.storage_name);
    }

    #[test]
    fn oversized_total_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServiceCfg { scratch_dir: dir.path().to_path_buf(), max_body_bytes: 4, ..ServiceCfg::default() };
        let gw = UploadGateway::new(&cfg);
        let req = CompareRequest::new(part("a.png", b"abc"), part("b.png", b"de"));
        assert_eq!(gw.validate(req).unwrap_err(), ValidationError::TooLarge { limit: 4 });
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn same_name_gets_distinct_storage_names() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        let req = CompareRequest::new(part("same.png", b"x"), part("same.png", b"x"));
        let [a, b] = gw.validate(req).unwrap();
        assert_ne!(a.storage_name, b.storage_name);
    }

    #[tokio::test]
    async fn persist_writes_and_cleanup_removes() {
        let dir = tempfile::tempdir().unwrap();
        let scratch_dir = dir.path().join("uploads");
        let gw = gateway(&scratch_dir);
        let req = CompareRequest::new(part("../a.png", b"\x89PNG\r\n\x1a\n...."), part("b.gif", b"GIF89a..."));
        let [a, b] = gw.validate(req).unwrap();

        let mut scratch = ScratchSet::new();
        let sa = gw.persist(a, &mut scratch).await.unwrap();
        let sb = gw.persist(b, &mut scratch).await.unwrap();

        assert!(sa.path.starts_with(&scratch_dir));
        assert_eq!(std::fs::read(&sa.path).unwrap(), b"\x89PNG\r\n\x1a\n....");
        assert_eq!(sa.size, 12);
        assert_eq!(sa.original_name, "../a.png");
        assert_eq!(sa.sniffed, Some(ImageFormat::Png));
        assert!(!sa.format_mismatch());
        assert_eq!(sb.sniffed, Some(ImageFormat::Gif));
        assert_eq!(std::fs::read_dir(&scratch_dir).unwrap().count(), 2);

        let failures = scratch.cleanup().await;
        assert!(failures.is_empty());
        assert_eq!(std::fs::read_dir(&scratch_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn mismatched_content_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        let req = CompareRequest::new(part("a.jpg", b"\x89PNG\r\n\x1a\n...."), part("b.jpg", b"plain text"));
        let [a, b] = gw.validate(req).unwrap();
        let mut scratch = ScratchSet::new();
        let sa = gw.persist(a, &mut scratch).await.unwrap();
        let sb = gw.persist(b, &mut scratch).await.unwrap();
        assert!(sa.format_mismatch());
        assert_eq!(sb.sniffed, None);
        assert!(!sb.format_mismatch());
    }

    #[tokio::test]
    async fn dropping_scratch_set_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path());
        let req = CompareRequest::new(part("a.png", b"1"), part("b.png", b"2"));
        let [a, _] = gw.validate(req).unwrap();
        {
            let mut scratch = ScratchSet::new();
            let stored = gw.persist(a, &mut scratch).await.unwrap();
            assert!(stored.path.exists());
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unwritable_scratch_dir_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the directory should be.
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let gw = gateway(&blocker);
        let req = CompareRequest::new(part("a.png", b"1"), part("b.png", b"2"));
        let [a, _] = gw.validate(req).unwrap();

        let mut scratch = ScratchSet::new();
        match gw.persist(a, &mut scratch).await {
            Err(CompareError::Storage { message, .. }) => assert_eq!(message, "Failed to save uploaded images."),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(scratch.cleanup().await.is_empty());
    }

    #[tokio::test]
    async fn cleanup_reports_paths_it_cannot_remove() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.png");
        std::fs::write(&plain, b"x").unwrap();
        // remove_file refuses a directory.
        let stuck = dir.path().join("stuck.png");
        std::fs::create_dir(&stuck).unwrap();
        std::fs::write(stuck.join("inner"), b"x").unwrap();

        let mut scratch = ScratchSet::new();
        scratch.track(plain.clone());
        scratch.track(dir.path().join("never-written.png"));
        scratch.track(stuck.clone());

        let failures = scratch.cleanup().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, stuck);
        assert!(!plain.exists());
        assert!(stuck.exists());
        assert!(scratch.is_empty());
    }
}
