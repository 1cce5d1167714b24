//! Quota-bounded recording store backed by a single directory.
//!
//! Quota usage is never cached: every check sums the directory's current
//! contents, so files removed behind the server's back are accounted for.
//! Each operation is atomic on its own; a new file only appears under its
//! final name once fully written, and no operation ever replaces an
//! existing name.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use tracing::{debug, info, warn};

use screenreel_common::format::round2;

use crate::error::StoreError;
use crate::guard::NameGuard;

/// MIME types a client may declare for an upload without a warning.
const EXPECTED_MIMES: [&str; 3] = ["video/mp4", "video/webm", "video/x-matroska"];

/// Size limits enforced by [`QuotaStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_file_size: u64,
    pub quota: u64,
}

/// One file in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecording {
    pub filename: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub extension: String,
}

/// Aggregate usage computed at call time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Totals {
    pub count: usize,
    pub used: u64,
    pub limit: u64,
    pub available: u64,
    pub percent_used: f64,
}

#[derive(Debug, Clone)]
pub struct Listing {
    /// Newest first.
    pub entries: Vec<StoredRecording>,
    pub totals: Totals,
}

/// Outcome of an age-based cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub deleted_files: usize,
    pub deleted_bytes: u64,
}

pub struct QuotaStore {
    guard: NameGuard,
    limits: StoreLimits,
}

impl QuotaStore {
    /// Open (and create if needed) the store rooted at `root`.
    pub fn open(root: &Path, limits: StoreLimits) -> std::io::Result<Self> {
        let guard = NameGuard::new(root)?;
        info!(
            "Recording store at {} (max file {} bytes, quota {} bytes)",
            guard.root().display(),
            limits.max_file_size,
            limits.quota
        );
        Ok(Self { guard, limits })
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    /// Bytes currently held by all recordings.
    pub fn used_bytes(&self) -> Result<u64, StoreError> {
        Ok(self.entries()?.iter().map(|r| r.size).sum())
    }

    /// Store a new upload under a server-generated name.
    ///
    /// `declared_name` and `declared_mime` come from the client and are only
    /// used to pick the extension and to log suspicious uploads.
    pub fn put(
        &self,
        bytes: &[u8],
        declared_name: Option<&str>,
        declared_mime: Option<&str>,
    ) -> Result<StoredRecording, StoreError> {
        let size = bytes.len() as u64;
        if size > self.limits.max_file_size {
            return Err(StoreError::FileTooLarge {
                size,
                max: self.limits.max_file_size,
            });
        }

        let used = self.used_bytes()?;
        if used.saturating_add(size) > self.limits.quota {
            warn!("Quota exceeded: {used} used + {size} new > {}", self.limits.quota);
            return Err(StoreError::QuotaExceeded {
                needed: size,
                quota: self.limits.quota,
            });
        }

        let extension = NameGuard::upload_extension(declared_name);
        check_content(bytes, extension, declared_mime);

        let tmp = self.write_temp(bytes)?;
        let result = self.publish(&tmp, extension);
        if let Err(e) = std::fs::remove_file(&tmp) {
            warn!("Cannot remove temp upload {}: {e}", tmp.display());
        }
        let final_path = result?;

        let recording = self.describe(&final_path)?;
        info!("Stored {} ({} bytes)", recording.filename, recording.size);
        Ok(recording)
    }

    /// All recordings, newest first, with usage totals.
    pub fn list(&self) -> Result<Listing, StoreError> {
        let mut entries = self.entries()?;
        entries.sort_by(|a, b| {
            b.created
                .cmp(&a.created)
                .then_with(|| a.filename.cmp(&b.filename))
        });

        let used: u64 = entries.iter().map(|r| r.size).sum();
        let limit = self.limits.quota;
        let percent_used = if limit == 0 {
            0.0
        } else {
            round2(used as f64 / limit as f64 * 100.0)
        };

        Ok(Listing {
            totals: Totals {
                count: entries.len(),
                used,
                limit,
                available: limit.saturating_sub(used),
                percent_used,
            },
            entries,
        })
    }

    /// Rename `old` to a sanitized form of `new`, never overwriting.
    pub fn rename(&self, old: &str, new: &str) -> Result<StoredRecording, StoreError> {
        let old_path = self.guard.resolve_existing(old)?;
        NameGuard::check_extension(old)?;

        let new_name = NameGuard::sanitize(new);
        NameGuard::check_extension(&new_name)?;
        let new_path = self.guard.target_for(&new_name)?;

        // A hard link fails instead of replacing an existing name, so of two
        // concurrent renames onto the same target only one can succeed.
        match std::fs::hard_link(&old_path, &new_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::NameCollision(new_name));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(old.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = std::fs::remove_file(&old_path) {
            // Lost a race with another rename or delete of `old`.
            let _ = std::fs::remove_file(&new_path);
            return Err(match e.kind() {
                ErrorKind::NotFound => StoreError::NotFound(old.to_string()),
                _ => e.into(),
            });
        }

        info!("Renamed {old} → {new_name}");
        self.describe(&new_path)
    }

    /// Remove one recording.
    pub fn delete(&self, name: &str) -> Result<StoredRecording, StoreError> {
        let path = self.guard.resolve_existing(name)?;
        NameGuard::check_extension(name)?;

        let recording = self.describe(&path)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        info!("Deleted {} ({} bytes)", recording.filename, recording.size);
        Ok(recording)
    }

    /// Delete every recording created more than `days` days ago.
    pub fn clean_older_than(&self, days: u32) -> Result<CleanReport, StoreError> {
        self.clean_older_than_at(days, Utc::now())
    }

    /// [`clean_older_than`](Self::clean_older_than) against an explicit clock.
    pub fn clean_older_than_at(
        &self,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<CleanReport, StoreError> {
        let cutoff = now - chrono::Duration::days(i64::from(days));
        let mut report = CleanReport::default();

        for recording in self.entries()? {
            if recording.created >= cutoff {
                continue;
            }
            let path = self.guard.root().join(&recording.filename);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    report.deleted_files += 1;
                    report.deleted_bytes += recording.size;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Cannot remove {}: {e}", path.display()),
            }
        }

        if report.deleted_files > 0 {
            info!(
                "Cleaned {} recording(s) older than {days} day(s), {} bytes",
                report.deleted_files, report.deleted_bytes
            );
        } else {
            debug!("Nothing older than {days} day(s) to clean");
        }
        Ok(report)
    }

    /// Path of a recording that may be served to clients.
    pub fn readable(&self, name: &str) -> Result<PathBuf, StoreError> {
        let path = self.guard.resolve_existing(name)?;
        NameGuard::check_extension(name)?;
        Ok(path)
    }

    // ── internals ────────────────────────────────────────────────────────

    fn entries(&self) -> Result<Vec<StoredRecording>, StoreError> {
        let mut recordings = Vec::new();
        for entry in std::fs::read_dir(self.guard.root())? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skipping unreadable directory entry: {e}");
                    continue;
                }
            };
            let path = entry.path();
            if !NameGuard::is_recording(&path) {
                continue;
            }
            match entry.file_type() {
                Ok(t) if t.is_file() => {}
                _ => continue,
            }
            match self.describe(&path) {
                Ok(r) => recordings.push(r),
                // Removed between read_dir and stat.
                Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recordings)
    }

    fn describe(&self, path: &Path) -> Result<StoredRecording, StoreError> {
        let meta = std::fs::metadata(path)?;
        let filename = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let created = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(StoredRecording {
            extension: NameGuard::extension_of(&filename).unwrap_or_default(),
            filename,
            size: meta.len(),
            created,
        })
    }

    fn write_temp(&self, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let tmp = self
            .guard
            .root()
            .join(format!(".upload-{}.part", random_hex()));
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)?;
        let written = file.write_all(bytes).and_then(|()| file.sync_all());
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(tmp)
    }

    /// Link the finished temp file under a fresh unguessable name.
    fn publish(&self, tmp: &Path, extension: &str) -> Result<PathBuf, StoreError> {
        for _ in 0..3 {
            let path = self.guard.root().join(generate_filename(extension));
            match std::fs::hard_link(tmp, &path) {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Io(std::io::Error::new(
            ErrorKind::AlreadyExists,
            "could not allocate a unique recording name",
        )))
    }
}

/// `rec_<local timestamp>_<64 random bits>.<ext>`
fn generate_filename(extension: &str) -> String {
    format!(
        "rec_{}_{}.{extension}",
        Local::now().format("%Y%m%d%H%M%S"),
        random_hex()
    )
}

fn random_hex() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Container family recognised from the leading bytes.
fn sniff_container(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
        Some("mp4")
    } else if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        // EBML header: WebM and Matroska share it.
        Some("webm")
    } else {
        None
    }
}

/// Log, never reject, uploads whose content does not look like their type.
fn check_content(bytes: &[u8], extension: &str, declared_mime: Option<&str>) {
    let sniffed = sniff_container(bytes);
    let consistent = match (sniffed, extension) {
        (Some("mp4"), "mp4") => true,
        (Some("webm"), "webm" | "mkv") => true,
        _ => false,
    };
    if !consistent {
        warn!(
            "Upload content ({}) does not match extension .{extension}; storing anyway",
            sniffed.unwrap_or("unknown")
        );
    }

    if let Some(mime) = declared_mime {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        if !EXPECTED_MIMES.contains(&essence) {
            warn!("Upload declared MIME type {mime:?}; storing anyway");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    const MP4_HEADER: &[u8] = b"\0\0\0\x20ftypisom";

    fn store(max_file_size: u64, quota: u64) -> (tempfile::TempDir, QuotaStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = QuotaStore::open(dir.path(), StoreLimits { max_file_size, quota }).unwrap();
        (dir, store)
    }

    fn payload(len: usize) -> Vec<u8> {
        let mut bytes = MP4_HEADER.to_vec();
        bytes.resize(len.max(MP4_HEADER.len()), 0xAB);
        bytes
    }

    fn set_mtime(path: &Path, when: SystemTime) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(when).unwrap();
    }

    #[test]
    fn test_put_is_visible_in_list() {
        let (_dir, store) = store(1000, 10_000);
        let rec = store.put(&payload(100), Some("x.webm"), Some("video/webm")).unwrap();

        assert!(rec.filename.starts_with("rec_"));
        assert!(rec.filename.ends_with(".webm"));
        assert_eq!(rec.size, 100);

        let listing = store.list().unwrap();
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.entries[0].filename, rec.filename);
        assert_eq!(listing.entries[0].size, 100);
        assert_eq!(listing.totals.used, 100);
        assert_eq!(listing.totals.available, 9_900);
        assert_eq!(listing.totals.percent_used, 1.0);
    }

    #[test]
    fn test_put_ignores_client_name() {
        let (_dir, store) = store(1000, 10_000);
        let a = store.put(&payload(20), Some("../../evil.mp4"), None).unwrap();
        let b = store.put(&payload(20), Some("../../evil.mp4"), None).unwrap();
        assert_ne!(a.filename, b.filename);
        assert!(!a.filename.contains("evil"));
    }

    #[test]
    fn test_put_unknown_extension_defaults_to_mp4() {
        let (_dir, store) = store(1000, 10_000);
        let rec = store.put(&payload(20), Some("clip.avi"), Some("video/avi")).unwrap();
        assert_eq!(rec.extension, "mp4");
    }

    #[test]
    fn test_put_limits() {
        let (_dir, store) = store(100, 250);

        assert!(matches!(
            store.put(&payload(101), None, None),
            Err(StoreError::FileTooLarge { size: 101, max: 100 })
        ));

        store.put(&payload(100), None, None).unwrap();
        store.put(&payload(100), None, None).unwrap();
        // 200 used: 50 more fits exactly, 51 would not.
        assert!(matches!(
            store.put(&payload(51), None, None),
            Err(StoreError::QuotaExceeded { .. })
        ));
        store.put(&payload(50), None, None).unwrap();
        assert_eq!(store.used_bytes().unwrap(), 250);
    }

    #[test]
    fn test_quota_counts_external_changes() {
        let (dir, store) = store(100, 150);
        std::fs::write(dir.path().join("manual.mkv"), vec![0u8; 100]).unwrap();
        assert!(matches!(
            store.put(&payload(60), None, None),
            Err(StoreError::QuotaExceeded { .. })
        ));
        std::fs::remove_file(dir.path().join("manual.mkv")).unwrap();
        store.put(&payload(60), None, None).unwrap();
    }

    #[test]
    fn test_temp_files_are_not_listed_or_left_behind() {
        let (dir, store) = store(1000, 10_000);
        store.put(&payload(30), None, None).unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 1, "unexpected files: {names:?}");
        assert!(!names[0].starts_with('.'));
    }

    #[test]
    fn test_list_newest_first() {
        let (dir, store) = store(1000, 10_000);
        let now = SystemTime::now();
        for (name, age) in [("old.mp4", 300), ("new.mp4", 10), ("mid.mp4", 100)] {
            let path = dir.path().join(name);
            std::fs::write(&path, b"data").unwrap();
            set_mtime(&path, now - Duration::from_secs(age));
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let names: Vec<_> = store
            .list()
            .unwrap()
            .entries
            .into_iter()
            .map(|r| r.filename)
            .collect();
        assert_eq!(names, ["new.mp4", "mid.mp4", "old.mp4"]);
    }

    #[test]
    fn test_rename() {
        let (dir, store) = store(1000, 10_000);
        let rec = store.put(&payload(40), None, None).unwrap();

        let renamed = store.rename(&rec.filename, "meeting notes.mp4").unwrap();
        assert_eq!(renamed.filename, "meeting_notes.mp4");
        assert_eq!(renamed.size, 40);
        assert!(!dir.path().join(&rec.filename).exists());
        assert!(dir.path().join("meeting_notes.mp4").exists());
    }

    #[test]
    fn test_rename_rules() {
        let (dir, store) = store(1000, 10_000);
        std::fs::write(dir.path().join("a.mp4"), b"a").unwrap();
        std::fs::write(dir.path().join("b.mp4"), b"b").unwrap();

        assert!(matches!(
            store.rename("a.mp4", "b.mp4"),
            Err(StoreError::NameCollision(n)) if n == "b.mp4"
        ));
        assert_eq!(std::fs::read(dir.path().join("b.mp4")).unwrap(), b"b");

        assert!(matches!(
            store.rename("a.mp4", "a.exe"),
            Err(StoreError::InvalidExtension(_))
        ));
        assert!(matches!(
            store.rename("../a.mp4", "c.mp4"),
            Err(StoreError::PathEscape(_))
        ));
        assert!(matches!(
            store.rename("missing.mp4", "c.mp4"),
            Err(StoreError::NotFound(_))
        ));
        // Traversal in the new name is stripped to its base name.
        let moved = store.rename("a.mp4", "../../c.mp4").unwrap();
        assert_eq!(moved.filename, "c.mp4");
        assert!(dir.path().join("c.mp4").exists());
    }

    #[test]
    fn test_concurrent_renames_have_one_winner() {
        let (dir, store) = store(1000, 10_000);
        std::fs::write(dir.path().join("one.mp4"), b"1").unwrap();
        std::fs::write(dir.path().join("two.mp4"), b"2").unwrap();
        let store = std::sync::Arc::new(store);

        let handles: Vec<_> = ["one.mp4", "two.mp4"]
            .into_iter()
            .map(|old| {
                let store = store.clone();
                std::thread::spawn(move || store.rename(old, "final.mp4"))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(StoreError::NameCollision(_)))));
        assert_eq!(store.list().unwrap().totals.count, 2);
    }

    #[test]
    fn test_delete() {
        let (dir, store) = store(1000, 10_000);
        let rec = store.put(&payload(25), None, None).unwrap();

        let deleted = store.delete(&rec.filename).unwrap();
        assert_eq!(deleted.size, 25);
        assert!(matches!(
            store.delete(&rec.filename),
            Err(StoreError::NotFound(_))
        ));

        std::fs::write(dir.path().join("keep.txt"), b"x").unwrap();
        assert!(matches!(
            store.delete("keep.txt"),
            Err(StoreError::InvalidExtension(_))
        ));
        assert!(matches!(
            store.delete("../keep.txt"),
            Err(StoreError::PathEscape(_))
        ));
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn test_clean_boundary() {
        let (dir, store) = store(1000, 10_000);
        let now = SystemTime::now();
        let day = Duration::from_secs(86_400);

        let fresh = dir.path().join("fresh.mp4");
        std::fs::write(&fresh, vec![0u8; 10]).unwrap();
        set_mtime(&fresh, now - 7 * day + Duration::from_secs(1));

        let stale = dir.path().join("stale.webm");
        std::fs::write(&stale, vec![0u8; 20]).unwrap();
        set_mtime(&stale, now - 7 * day - Duration::from_secs(1));

        let report = store
            .clean_older_than_at(7, DateTime::<Utc>::from(now))
            .unwrap();
        assert_eq!(
            report,
            CleanReport {
                deleted_files: 1,
                deleted_bytes: 20
            }
        );
        assert!(fresh.exists());
        assert!(!stale.exists());

        // Second pass finds nothing and is not an error.
        let again = store
            .clean_older_than_at(7, DateTime::<Utc>::from(now))
            .unwrap();
        assert_eq!(again, CleanReport::default());
    }

    #[test]
    fn test_sniff_container() {
        assert_eq!(sniff_container(MP4_HEADER), Some("mp4"));
        assert_eq!(sniff_container(&[0x1A, 0x45, 0xDF, 0xA3, 0x01]), Some("webm"));
        assert_eq!(sniff_container(b"hello"), None);
    }
}
