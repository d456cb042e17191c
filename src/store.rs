//! Ephemeral artifact storage: two flat directories and nothing else.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!   incoming/  <uuid>.<ext>   staged uploads
//!   produced/  <uuid>.pdf     finished outputs
//! ```
//!
//! There is no index. A directory listing plus each file's modification time
//! is all the bookkeeping the garbage collector relies on, so anything that
//! can see the directories (another process, an operator with `ls`) agrees
//! with the store about what exists.
//!
//! ## Why write-then-rename?
//!
//! Every write lands in a hidden `.partial` temp file inside the target
//! region and is renamed into place once complete. A reader (or a sweep)
//! therefore sees an artifact either fully written or not at all.
//!
//! ## Concurrency
//!
//! Contention is resolved structurally: ids are fresh UUIDv4s and never
//! reused, and every delete is delete-if-exists. A sweep racing a release, or
//! two releases of the same artifact, both succeed.

use crate::error::PdfToolsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default directory name of the incoming region.
pub const INCOMING_DIR: &str = "incoming";
/// Default directory name of the produced region.
pub const PRODUCED_DIR: &str = "produced";

/// Opaque, never-reused artifact identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ArtifactId {
    type Err = PdfToolsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| PdfToolsError::Validation(format!("invalid artifact id '{s}': {e}")))
    }
}

/// Which of the two storage regions an artifact lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Incoming,
    Produced,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Incoming => f.write_str("incoming"),
            Region::Produced => f.write_str("produced"),
        }
    }
}

/// A complete file in one of the regions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub region: Region,
    pub extension: String,
    pub size: u64,
    pub created: SystemTime,
    pub path: PathBuf,
}

/// The two-region artifact store.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    incoming: PathBuf,
    produced: PathBuf,
}

impl ArtifactStore {
    /// Open a store under `root` with the default region names.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, PdfToolsError> {
        Self::open_with_dirs(root, INCOMING_DIR, PRODUCED_DIR)
    }

    /// Open a store with explicit region directory names.
    pub fn open_with_dirs(
        root: impl AsRef<Path>,
        incoming: &str,
        produced: &str,
    ) -> Result<Self, PdfToolsError> {
        let root = root.as_ref();
        let store = Self {
            incoming: root.join(incoming),
            produced: root.join(produced),
        };
        for dir in [&store.incoming, &store.produced] {
            std::fs::create_dir_all(dir).map_err(|e| PdfToolsError::io(dir, e))?;
        }
        info!(
            "Artifact store ready: incoming={} produced={}",
            store.incoming.display(),
            store.produced.display()
        );
        Ok(store)
    }

    /// Directory backing `region`.
    pub fn region_dir(&self, region: Region) -> &Path {
        match region {
            Region::Incoming => &self.incoming,
            Region::Produced => &self.produced,
        }
    }

    /// Where an artifact with this id and extension lives (or would live).
    pub fn path_for(&self, region: Region, id: ArtifactId, extension: &str) -> PathBuf {
        self.region_dir(region)
            .join(format!("{id}.{}", normalize_extension(extension)))
    }

    /// Find an existing artifact by id, whatever its extension.
    ///
    /// Returns `Ok(None)` when nothing with that id is in the region, e.g.
    /// because it was released or swept.
    pub async fn lookup(
        &self,
        region: Region,
        id: ArtifactId,
    ) -> Result<Option<Artifact>, PdfToolsError> {
        let dir = self.region_dir(region);
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| PdfToolsError::io(dir, e))?;
        let wanted = id.to_string();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PdfToolsError::io(dir, e))?
        {
            let path = entry.path();
            if path.file_stem().and_then(|s| s.to_str()) != Some(wanted.as_str()) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(PdfToolsError::io(&path, e)),
            };
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_string();
            return Ok(Some(Artifact {
                id,
                region,
                extension,
                size: meta.len(),
                created: meta.modified().unwrap_or_else(|_| SystemTime::now()),
                path,
            }));
        }
        Ok(None)
    }

    /// Stage caller-supplied bytes into the incoming region.
    ///
    /// The returned guard deletes the file when dropped unless promoted.
    pub async fn stage(
        &self,
        bytes: Vec<u8>,
        extension: &str,
    ) -> Result<StagedArtifact, PdfToolsError> {
        let ext = normalize_extension(extension);
        if ext.is_empty() {
            return Err(PdfToolsError::Validation(
                "artifact extension must not be empty".into(),
            ));
        }
        self.write(Region::Incoming, bytes, ext).await
    }

    /// Write a finished document into the produced region.
    pub async fn finalize(&self, bytes: Vec<u8>) -> Result<StagedArtifact, PdfToolsError> {
        self.write(Region::Produced, bytes, "pdf".to_string()).await
    }

    /// Reserve a fresh produced-region path for a tool that writes its own
    /// output (e.g. an external compressor).
    ///
    /// Nothing exists on disk yet; call [`ArtifactStore::seal`] once the
    /// file has been written. Dropping the slot deletes whatever was written.
    pub fn reserve(&self, extension: &str) -> OutputSlot {
        let id = ArtifactId::new();
        let extension = normalize_extension(extension);
        let path = self.produced.join(format!("{id}.{extension}"));
        OutputSlot {
            id,
            extension,
            path,
            armed: true,
        }
    }

    /// Turn a written slot into an artifact guard, checking the file is
    /// really there and non-empty.
    pub async fn seal(&self, mut slot: OutputSlot) -> Result<StagedArtifact, PdfToolsError> {
        let meta = match tokio::fs::metadata(&slot.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PdfToolsError::EmptyOutput {
                    path: slot.path.clone(),
                })
            }
            Err(e) => return Err(PdfToolsError::io(&slot.path, e)),
        };
        if meta.len() == 0 {
            return Err(PdfToolsError::EmptyOutput {
                path: slot.path.clone(),
            });
        }
        slot.armed = false;
        let artifact = Artifact {
            id: slot.id,
            region: Region::Produced,
            extension: std::mem::take(&mut slot.extension),
            size: meta.len(),
            created: meta.modified().unwrap_or_else(|_| SystemTime::now()),
            path: slot.path.clone(),
        };
        Ok(StagedArtifact::new(artifact))
    }

    /// Read an artifact's bytes.
    ///
    /// A missing file is an [`PdfToolsError::InternalIoFailure`]: whoever
    /// holds the artifact expected it to exist.
    pub async fn read(&self, artifact: &Artifact) -> Result<Vec<u8>, PdfToolsError> {
        tokio::fs::read(&artifact.path)
            .await
            .map_err(|e| PdfToolsError::io(&artifact.path, e))
    }

    /// Whether the artifact's file is still present.
    pub async fn exists(&self, artifact: &Artifact) -> bool {
        tokio::fs::try_exists(&artifact.path).await.unwrap_or(false)
    }

    /// Delete an artifact now. Deleting an absent artifact is not an error.
    pub async fn release(&self, artifact: &Artifact) -> Result<(), PdfToolsError> {
        match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => {
                debug!("Released {} artifact {}", artifact.region, artifact.id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PdfToolsError::io(&artifact.path, e)),
        }
    }

    /// Delete every entry in `region` older than `max_age`.
    ///
    /// Runs on the blocking pool. See [`ArtifactStore::sweep_at`].
    pub async fn sweep(&self, region: Region, max_age: Duration) -> Result<usize, PdfToolsError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.sweep_at(region, max_age, SystemTime::now()))
            .await
            .map_err(|e| PdfToolsError::Internal(format!("Sweep task panicked: {e}")))?
    }

    /// Delete every entry in `region` whose age at `now` exceeds `max_age`.
    ///
    /// Only a failure to list the directory aborts the pass. A failure on an
    /// individual entry is logged and the pass continues; an entry that
    /// vanished between listing and deletion is skipped silently.
    pub fn sweep_at(
        &self,
        region: Region,
        max_age: Duration,
        now: SystemTime,
    ) -> Result<usize, PdfToolsError> {
        let dir = self.region_dir(region);
        let entries = std::fs::read_dir(dir).map_err(|e| PdfToolsError::io(dir, e))?;

        let mut removed = 0;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Sweep of {}: unreadable entry: {}", region, e);
                    continue;
                }
            };
            let path = entry.path();

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!("Sweep of {}: cannot stat {}: {}", region, path.display(), e);
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }

            let modified = match meta.modified() {
                Ok(t) => t,
                Err(e) => {
                    warn!("Sweep of {}: no mtime for {}: {}", region, path.display(), e);
                    continue;
                }
            };
            // An mtime in the future counts as age zero.
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age <= max_age {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Swept {} ({}s old)", path.display(), age.as_secs());
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Sweep of {}: cannot delete {}: {}", region, path.display(), e),
            }
        }

        if removed > 0 {
            info!("Sweep of {} removed {} artifact(s)", region, removed);
        }
        Ok(removed)
    }

    /// Atomic write of `bytes` as a fresh artifact in `region`.
    async fn write(
        &self,
        region: Region,
        bytes: Vec<u8>,
        extension: String,
    ) -> Result<StagedArtifact, PdfToolsError> {
        let dir = self.region_dir(region).to_path_buf();
        tokio::task::spawn_blocking(move || write_blocking(&dir, region, &bytes, extension))
            .await
            .map_err(|e| PdfToolsError::Internal(format!("Write task panicked: {e}")))?
    }
}

/// Blocking implementation of the write-then-rename.
fn write_blocking(
    dir: &Path,
    region: Region,
    bytes: &[u8],
    extension: String,
) -> Result<StagedArtifact, PdfToolsError> {
    let id = ArtifactId::new();
    let path = dir.join(format!("{id}.{extension}"));

    let mut tmp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".partial")
        .tempfile_in(dir)
        .map_err(|e| PdfToolsError::io(dir, e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| PdfToolsError::io(tmp.path(), e))?;
    let file = tmp
        .persist(&path)
        .map_err(|e| PdfToolsError::io(&path, e.error))?;

    let created = file
        .metadata()
        .and_then(|m| m.modified())
        .unwrap_or_else(|_| SystemTime::now());

    debug!("Wrote {} artifact {} ({} bytes)", region, id, bytes.len());
    Ok(StagedArtifact::new(Artifact {
        id,
        region,
        extension,
        size: bytes.len() as u64,
        created,
        path,
    }))
}

/// Lower-case an extension and strip any leading dot.
pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

// ── Scoped guards ────────────────────────────────────────────────────────

/// An artifact that is deleted when the guard goes out of scope.
///
/// Every staged input and every freshly written output is held through one
/// of these, so success, error, cancellation and panic all release the file.
/// [`StagedArtifact::promote`] disarms the guard and hands the artifact to
/// the caller.
#[derive(Debug)]
pub struct StagedArtifact {
    artifact: Artifact,
    armed: bool,
}

impl StagedArtifact {
    fn new(artifact: Artifact) -> Self {
        Self {
            artifact,
            armed: true,
        }
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn path(&self) -> &Path {
        &self.artifact.path
    }

    /// Keep the file: ownership passes to the caller.
    pub fn promote(mut self) -> Artifact {
        self.armed = false;
        self.artifact.clone()
    }

    /// Delete the file now, off the async worker threads.
    pub async fn release(mut self) {
        self.armed = false;
        match tokio::fs::remove_file(&self.artifact.path).await {
            Ok(()) => debug!("Released {} artifact {}", self.artifact.region, self.artifact.id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to release {}: {}", self.artifact.path.display(), e),
        }
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if self.armed {
            remove_quietly(&self.artifact.path);
        }
    }
}

/// A reserved produced-region path that a tool writes into directly.
#[derive(Debug)]
pub struct OutputSlot {
    id: ArtifactId,
    extension: String,
    path: PathBuf,
    armed: bool,
}

impl OutputSlot {
    pub fn id(&self) -> ArtifactId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OutputSlot {
    fn drop(&mut self) {
        if self.armed {
            remove_quietly(&self.path);
        }
    }
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Dropped artifact {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ArtifactStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = ArtifactStore::open(dir.path()).expect("open store");
        (dir, store)
    }

    #[test]
    fn normalize_extension_strips_dot_and_lowercases() {
        assert_eq!(normalize_extension(".JPG"), "jpg");
        assert_eq!(normalize_extension("Png"), "png");
        assert_eq!(normalize_extension(" .pdf "), "pdf");
    }

    #[tokio::test]
    async fn stage_writes_into_incoming_with_extension() {
        let (_dir, store) = store();
        let staged = store.stage(b"hello".to_vec(), ".PNG").await.unwrap();
        let artifact = staged.artifact().clone();

        assert_eq!(artifact.region, Region::Incoming);
        assert_eq!(artifact.size, 5);
        assert!(artifact.path.starts_with(store.region_dir(Region::Incoming)));
        assert_eq!(
            artifact.path.file_name().unwrap().to_string_lossy(),
            format!("{}.png", artifact.id)
        );
        assert_eq!(store.read(&artifact).await.unwrap(), b"hello");

        let kept = staged.promote();
        assert!(store.exists(&kept).await);
    }

    #[tokio::test]
    async fn stage_rejects_empty_extension() {
        let (_dir, store) = store();
        let err = store.stage(b"x".to_vec(), ".").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn ids_are_never_reused() {
        let (_dir, store) = store();
        let a = store.finalize(b"%PDF-1".to_vec()).await.unwrap().promote();
        let b = store.finalize(b"%PDF-1".to_vec()).await.unwrap().promote();
        assert_ne!(a.id, b.id);
        assert_ne!(a.path, b.path);
    }

    #[tokio::test]
    async fn dropped_guard_deletes_file() {
        let (_dir, store) = store();
        let staged = store.finalize(b"%PDF-1.5".to_vec()).await.unwrap();
        let artifact = staged.artifact().clone();
        assert!(store.exists(&artifact).await);
        drop(staged);
        assert!(!store.exists(&artifact).await);
    }

    #[tokio::test]
    async fn lookup_finds_by_id_until_released() {
        let (_dir, store) = store();
        let artifact = store.stage(b"abc".to_vec(), "gif").await.unwrap().promote();

        let found = store
            .lookup(Region::Incoming, artifact.id)
            .await
            .unwrap()
            .expect("present");
        assert_eq!(found.extension, "gif");
        assert_eq!(found.size, 3);
        assert_eq!(found.path, store.path_for(Region::Incoming, artifact.id, ".GIF"));
        assert!(store.lookup(Region::Produced, artifact.id).await.unwrap().is_none());

        store.release(&artifact).await.unwrap();
        assert!(store.lookup(Region::Incoming, artifact.id).await.unwrap().is_none());
    }

    #[test]
    fn artifact_id_parses_from_display() {
        let id = ArtifactId::new();
        assert_eq!(id.to_string().parse::<ArtifactId>().unwrap(), id);
        assert!("not-a-uuid".parse::<ArtifactId>().is_err());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (_dir, store) = store();
        let artifact = store.stage(b"x".to_vec(), "jpg").await.unwrap().promote();
        store.release(&artifact).await.unwrap();
        store.release(&artifact).await.unwrap();
        assert!(!store.exists(&artifact).await);
    }

    #[tokio::test]
    async fn seal_rejects_missing_and_empty_output() {
        let (_dir, store) = store();

        let slot = store.reserve("pdf");
        let err = store.seal(slot).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::EmptyOutput);

        let slot = store.reserve("pdf");
        let path = slot.path().to_path_buf();
        std::fs::write(&path, b"").unwrap();
        let err = store.seal(slot).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::EmptyOutput);
        // The failed slot was dropped, taking the empty file with it.
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn seal_accepts_written_output() {
        let (_dir, store) = store();
        let slot = store.reserve("pdf");
        std::fs::write(slot.path(), b"%PDF-1.4 data").unwrap();
        let staged = store.seal(slot).await.unwrap();
        assert_eq!(staged.artifact().region, Region::Produced);
        assert_eq!(staged.artifact().size, 13);
    }

    #[tokio::test]
    async fn sweep_respects_ttl_boundary() {
        let (_dir, store) = store();
        let artifact = store.stage(b"x".to_vec(), "jpg").await.unwrap().promote();
        let created = artifact.created;
        let ttl = Duration::from_secs(3600);

        let removed = store
            .sweep_at(Region::Incoming, ttl, created + Duration::from_secs(59 * 60))
            .unwrap();
        assert_eq!(removed, 0);
        assert!(store.exists(&artifact).await);

        let removed = store
            .sweep_at(Region::Incoming, ttl, created + Duration::from_secs(61 * 60))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!store.exists(&artifact).await);
    }

    #[tokio::test]
    async fn sweep_only_touches_its_region() {
        let (_dir, store) = store();
        let incoming = store.stage(b"x".to_vec(), "png").await.unwrap().promote();
        let produced = store.finalize(b"%PDF".to_vec()).await.unwrap().promote();
        let later = SystemTime::now() + Duration::from_secs(7200);

        assert_eq!(
            store
                .sweep_at(Region::Produced, Duration::from_secs(3600), later)
                .unwrap(),
            1
        );
        assert!(store.exists(&incoming).await);
        assert!(!store.exists(&produced).await);
    }

    #[tokio::test]
    async fn sweep_skips_directories() {
        let (_dir, store) = store();
        std::fs::create_dir(store.region_dir(Region::Incoming).join("nested")).unwrap();
        let later = SystemTime::now() + Duration::from_secs(7200);
        let removed = store
            .sweep_at(Region::Incoming, Duration::from_secs(1), later)
            .unwrap();
        assert_eq!(removed, 0);
        assert!(store.region_dir(Region::Incoming).join("nested").is_dir());
    }
}
