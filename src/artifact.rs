//! Generated artifacts on local storage.
//!
//! Artifacts live flat in one output directory. Filenames are derived from
//! the wall clock (music) or the epoch second plus seed (images) and are
//! never cleaned up.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Local};

use crate::{Error, Result};

const NOT_FOUND: &str = "File not found";

/// Kind of generated artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Music,
    Image,
}

impl ArtifactKind {
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Music => "wav",
            ArtifactKind::Image => "png",
        }
    }

    /// Filename for an artifact generated at `now` with `seed`.
    ///
    /// Music names only have second granularity, so two music artifacts from
    /// the same second share a name.
    pub fn filename(self, now: DateTime<Local>, seed: u32) -> String {
        match self {
            ArtifactKind::Music => {
                format!("music_{}.{}", now.format("%Y%m%d_%H%M%S"), self.extension())
            }
            ArtifactKind::Image => format!("img_{}_{}.{}", now.timestamp(), seed, self.extension()),
        }
    }
}

/// Media type served for `filename`, from its extension. Matching is case-sensitive.
pub fn media_type(filename: &str) -> &'static str {
    match Path::new(filename).extension().and_then(|e| e.to_str()) {
        Some("wav") => "audio/wav",
        Some("png") => "image/png",
        Some("jpg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// A written artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub url: String,
    pub filename: String,
}

/// A stored artifact located for serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub path: PathBuf,
    pub media_type: &'static str,
}

/// Flat directory of artifacts plus the public URL prefix they are served under.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    base_url: String,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            dir: dir.into(),
            base_url,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn url_for(&self, filename: &str) -> String {
        format!("{}/{}", self.base_url, filename)
    }

    /// Write `bytes` under `filename`, creating the directory if needed.
    ///
    /// Bytes land in a sibling temp file that is renamed into place, so the
    /// final name never holds a partial artifact.
    pub async fn write(&self, filename: &str, bytes: &[u8]) -> Result<StoredArtifact> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(filename);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::warn!(path = %path.display(), "overwriting existing artifact");
        }

        let partial = self
            .dir
            .join(format!(".{filename}.{:08x}.part", rand::random::<u32>()));
        let written = match tokio::fs::write(&partial, bytes).await {
            Ok(()) => tokio::fs::rename(&partial, &path).await,
            Err(e) => Err(e),
        };
        if let Err(error) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                tracing::debug!(path = %partial.display(), error = %cleanup, "partial artifact not removed");
            }
            return Err(error.into());
        }
        tracing::info!(path = %path.display(), bytes = bytes.len(), "artifact written");
        Ok(StoredArtifact {
            url: self.url_for(filename),
            filename: filename.to_string(),
            path,
        })
    }

    /// Locate `filename` for serving.
    ///
    /// Only a single plain path component is accepted.
    pub async fn resolve(&self, filename: &str) -> Result<ResolvedArtifact> {
        if !is_plain_name(filename) {
            return Err(Error::NotFound(NOT_FOUND.to_string()));
        }
        let path = self.dir.join(filename);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(ResolvedArtifact {
                path,
                media_type: media_type(filename),
            }),
            _ => Err(Error::NotFound(NOT_FOUND.to_string())),
        }
    }
}

fn is_plain_name(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_music_filename_uses_local_time() {
        let name = ArtifactKind::Music.filename(at(2024, 3, 9, 7, 5, 2), 99);
        assert_eq!(name, "music_20240309_070502.wav");
    }

    #[test]
    fn test_image_filename_uses_epoch_and_seed() {
        let now = at(2024, 3, 9, 7, 5, 2);
        let name = ArtifactKind::Image.filename(now, 4_000_000_000);
        assert_eq!(name, format!("img_{}_4000000000.png", now.timestamp()));
        assert_ne!(name, ArtifactKind::Image.filename(now, 1));
    }

    #[test]
    fn test_media_type() {
        assert_eq!(media_type("a.wav"), "audio/wav");
        assert_eq!(media_type("a.png"), "image/png");
        assert_eq!(media_type("a.PNG"), "application/octet-stream");
        assert_eq!(media_type("a.Wav"), "application/octet-stream");
        assert_eq!(media_type("a.jpg"), "image/jpeg");
        assert_eq!(media_type("a.jpeg"), "application/octet-stream");
        assert_eq!(media_type("noext"), "application/octet-stream");
    }

    #[test]
    fn test_plain_names() {
        assert!(is_plain_name("music_1.wav"));
        assert!(!is_plain_name(""));
        assert!(!is_plain_name(".."));
        assert!(!is_plain_name("."));
        assert!(!is_plain_name("../secret"));
        assert!(!is_plain_name("a/b.wav"));
        assert!(!is_plain_name("a\\b.wav"));
        assert!(!is_plain_name("/etc/passwd"));
    }

    #[tokio::test]
    async fn test_write_then_resolve() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("outputs"), "http://localhost:8000/files/");

        let stored = store.write("img_1_2.png", b"png-bytes").await.unwrap();
        assert_eq!(stored.url, "http://localhost:8000/files/img_1_2.png");
        assert_eq!(stored.filename, "img_1_2.png");
        assert_eq!(std::fs::read(&stored.path).unwrap(), b"png-bytes");

        let resolved = store.resolve("img_1_2.png").await.unwrap();
        assert_eq!(resolved.path, stored.path);
        assert_eq!(resolved.media_type, "image/png");
    }

    #[tokio::test]
    async fn test_resolve_missing_or_escaping() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("outside.wav"), b"x").unwrap();
        let store = ArtifactStore::new(tmp.path().join("outputs"), "http://x/files");
        std::fs::create_dir_all(store.dir()).unwrap();

        for name in ["missing.wav", "../outside.wav", ".."] {
            let err = store.resolve(name).await.unwrap_err();
            assert!(matches!(err, Error::NotFound(ref m) if m == "File not found"), "{name}");
        }
    }

    #[tokio::test]
    async fn test_write_overwrites_same_name() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path(), "http://x/files");
        store.write("music_a.wav", b"first").await.unwrap();
        let stored = store.write("music_a.wav", b"second").await.unwrap();
        assert_eq!(std::fs::read(stored.path).unwrap(), b"second");

        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["music_a.wav".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path(), "http://x/files");
        // A directory squatting on the final name makes the rename fail.
        std::fs::create_dir(tmp.path().join("music_b.wav")).unwrap();
        std::fs::write(tmp.path().join("music_b.wav").join("keep"), b"x").unwrap();

        assert!(store.write("music_b.wav", b"bytes").await.is_err());

        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["music_b.wav".to_string()]);
        assert!(matches!(
            store.resolve("music_b.wav").await,
            Err(Error::NotFound(_))
        ));
    }
}
