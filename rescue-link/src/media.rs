//! Photos received over the radio, and media waiting for the side-channel.
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::NodeError;
use crate::LoRaAddress;

const JPEG_SIGNATURE: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    /// Recognises a complete image by its signature.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(JPEG_SIGNATURE) {
            Some(ImageFormat::Jpeg)
        } else if bytes.starts_with(PNG_SIGNATURE) {
            Some(ImageFormat::Png)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

/// A photo delivered to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Photo {
    Saved(PathBuf),
    Bytes(Vec<u8>),
}

/// Writes reassembled photos to a directory.
#[derive(Clone, Debug)]
pub struct MediaStore {
    dir: PathBuf,
}

impl MediaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Saves `bytes` as `photo_from_<addr>_<unix secs>.<ext>`.
    pub fn save_photo(
        &self,
        from: LoRaAddress,
        format: ImageFormat,
        bytes: &[u8],
        at: SystemTime,
    ) -> Result<PathBuf, NodeError> {
        fs::create_dir_all(&self.dir)?;
        let secs = at.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        let path = self
            .dir
            .join(format!("photo_from_{}_{}.{}", from, secs, format.extension()));
        fs::write(&path, bytes)?;
        info!("Photo from {} saved in {}.", from, path.display());
        Ok(path)
    }
}

/// A capture waiting for the side-channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub path: PathBuf,
    pub video: bool,
}

/// Captured media not yet delivered, persisted as a JSON list.
#[derive(Debug)]
pub struct PendingMedia {
    file: PathBuf,
    entries: Vec<PendingEntry>,
}

impl PendingMedia {
    /// Loads the list, starting empty when the file is missing or unreadable.
    pub fn load(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let entries = match fs::read_to_string(&file) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                debug!("Ignored invalid pending media list {}: {}", file.display(), err);
                Vec::new()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                debug!("Could not read pending media list {}: {}", file.display(), err);
                Vec::new()
            }
        };
        Self { file, entries }
    }

    /// Adds `path` unless already listed, returns whether it was added.
    pub fn mark(&mut self, path: &Path, video: bool) -> Result<bool, NodeError> {
        if self.entries.iter().any(|entry| entry.path == path) {
            return Ok(false);
        }
        self.entries.push(PendingEntry {
            path: path.to_path_buf(),
            video,
        });
        self.save()?;
        info!("Media marked as pending: {}", path.display());
        Ok(true)
    }

    /// Removes `path`, returns whether it was listed.
    pub fn clear(&mut self, path: &Path) -> Result<bool, NodeError> {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.path != path);
        if self.entries.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn list(&self) -> &[PendingEntry] {
        &self.entries
    }

    fn save(&self) -> Result<(), NodeError> {
        let text = serde_json::to_string_pretty(&self.entries)
            .map_err(|err| NodeError::Io(std::io::Error::new(ErrorKind::InvalidData, err)))?;
        fs::write(&self.file, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn image_signatures() {
        assert_eq!(ImageFormat::detect(&[0xFF, 0xD8, 0xFF, 0xE0, 0]), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::detect(PNG_SIGNATURE), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::detect(b"GIF89a"), None);
        assert_eq!(ImageFormat::detect(&[]), None);
    }

    #[test]
    fn photo_is_named_after_sender_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("photos"));
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let path = store
            .save_photo(3, ImageFormat::Jpeg, &[0xFF, 0xD8, 0xFF], at)
            .unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "photo_from_3_1700000000.jpg"
        );
        assert_eq!(fs::read(&path).unwrap(), vec![0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn pending_list_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pending.json");
        let mut pending = PendingMedia::load(&file);
        assert!(pending.list().is_empty());
        assert!(pending.mark(Path::new("/media/a.jpg"), false).unwrap());
        assert!(!pending.mark(Path::new("/media/a.jpg"), false).unwrap());
        assert!(pending.mark(Path::new("/media/b.mp4"), true).unwrap());

        let mut reloaded = PendingMedia::load(&file);
        assert_eq!(reloaded.list().len(), 2);
        assert!(reloaded.clear(Path::new("/media/a.jpg")).unwrap());
        assert!(!reloaded.clear(Path::new("/media/a.jpg")).unwrap());
        assert_eq!(
            PendingMedia::load(&file).list(),
            &[PendingEntry {
                path: PathBuf::from("/media/b.mp4"),
                video: true,
            }]
        );
    }

    #[test]
    fn corrupt_pending_list_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pending.json");
        fs::write(&file, "not json").unwrap();
        assert!(PendingMedia::load(&file).list().is_empty());
    }
}
