//! Volume archive codec and the in-pod hydration/dehydration entry points
//!
//! An archive is a zip of the whole shared volume, relative to its root. The
//! engine's own state directory (`.canopy/`) is never archived.
//!
//! Hydration runs in every workload's init container, so several run against
//! the same volume at once. Coordination happens on the volume itself:
//! - the first hydrator to create `.canopy/hydration.lock` restores the archive
//!   and writes `.canopy/hydrated`
//! - the others wait for the marker
//! - once the marker exists, hydration is a no-op, so restarts never roll live
//!   data back to an older archive

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::storage::{ObjectStore, StorageError};
use crate::{Error, Result};

/// Engine state directory at the volume root
pub const STATE_DIR: &str = ".canopy";
/// Marker written after a successful hydration
pub const HYDRATED_MARKER: &str = "hydrated";
/// Lock held by the hydrator doing the restore
pub const HYDRATION_LOCK: &str = "hydration.lock";

const WAIT_POLL: Duration = Duration::from_millis(250);

/// How a hydration call ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HydrationOutcome {
    /// The archive was restored into the volume
    Restored {
        /// Archive size in bytes
        bytes: u64,
    },
    /// No archive exists yet; the volume starts empty
    Fresh,
    /// Another hydrator restored the volume
    RestoredByPeer,
    /// The volume was hydrated earlier
    AlreadyHydrated,
}

fn io_err(context: &str, path: &Path, e: io::Error) -> Error {
    Error::archive(context, format!("{}: {}", path.display(), e))
}

fn is_state_path(rel: &Path) -> bool {
    rel.components()
        .next()
        .is_some_and(|c| c.as_os_str() == STATE_DIR)
}

fn entry_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("symlinks unsupported: {}", link.display()),
    ))
}

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Whether a link at `link` (relative to the root) pointing at `target`
/// resolves inside the root
fn link_stays_inside(link: &Path, target: &Path) -> bool {
    let mut depth = link.components().count().saturating_sub(1);
    for component in target.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(_) => depth += 1,
            Component::ParentDir if depth > 0 => depth -= 1,
            _ => return false,
        }
    }
    true
}

/// Whether `rel` or any of its ancestors under `root` is a symlink
fn through_symlink(root: &Path, rel: &Path) -> bool {
    let mut path = root.to_path_buf();
    rel.components().any(|c| {
        path.push(c);
        fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_symlink())
    })
}

/// Zip a directory tree into `sink`
///
/// Entries are written in sorted order so the same tree always produces the
/// same entry list. Symlinks are stored as links, never followed.
pub fn pack_into<W: Write + Seek>(root: &Path, sink: W) -> Result<W> {
    let mut writer = ZipWriter::new(sink);
    let base = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            e.path()
                .strip_prefix(root)
                .map_or(true, |rel| !is_state_path(rel))
        });

    for entry in walker {
        let entry = entry.map_err(|e| Error::archive("pack", e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::archive("pack", e.to_string()))?;
        let name = entry_name(rel);
        let meta = entry
            .metadata()
            .map_err(|e| Error::archive("pack", e.to_string()))?;

        if entry.file_type().is_symlink() {
            let target = fs::read_link(entry.path()).map_err(|e| io_err("pack", entry.path(), e))?;
            writer.add_symlink(name, target.to_string_lossy(), base.unix_permissions(0o777))?;
            continue;
        }

        let options = base.unix_permissions(file_mode(&meta));
        if entry.file_type().is_dir() {
            writer.add_directory(name, options)?;
        } else {
            let options = options.large_file(meta.len() >= u64::from(u32::MAX));
            writer.start_file(name, options)?;
            let mut file = File::open(entry.path()).map_err(|e| io_err("pack", entry.path(), e))?;
            io::copy(&mut file, &mut writer).map_err(|e| io_err("pack", entry.path(), e))?;
        }
    }

    Ok(writer.finish()?)
}

/// Zip a directory tree into memory
pub fn pack_dir(root: &Path) -> Result<Vec<u8>> {
    Ok(pack_into(root, Cursor::new(Vec::new()))?.into_inner())
}

/// Unpack a zip into a directory, returning the number of files written
///
/// Entries that would escape `root`, entries under the state directory,
/// entries reached through a symlink and links pointing outside `root` are
/// skipped. Directory modes are applied last so read-only directories can
/// still be filled.
pub fn unpack_into(bytes: &[u8], root: &Path) -> Result<usize> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut files = 0;
    let mut dir_modes = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            warn!(entry = %entry.name(), "skipping archive entry outside the volume");
            continue;
        };
        if is_state_path(&rel) {
            continue;
        }
        if through_symlink(root, &rel) {
            warn!(entry = %entry.name(), "skipping archive entry behind a symlink");
            continue;
        }
        let target = root.join(&rel);
        let mode = entry.unix_mode();

        if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            let mut link = String::new();
            entry
                .read_to_string(&mut link)
                .map_err(|e| io_err("unpack", &target, e))?;
            let link = PathBuf::from(link);
            if !link_stays_inside(&rel, &link) {
                warn!(entry = %entry.name(), target = %link.display(), "skipping symlink leaving the volume");
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err("unpack", parent, e))?;
            }
            make_symlink(&link, &target).map_err(|e| io_err("unpack", &target, e))?;
            files += 1;
            continue;
        }

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| io_err("unpack", &target, e))?;
            if let Some(mode) = mode {
                dir_modes.push((target, mode & 0o7777));
            }
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("unpack", parent, e))?;
        }
        let mut out = File::create(&target).map_err(|e| io_err("unpack", &target, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| io_err("unpack", &target, e))?;
        if let Some(mode) = mode {
            set_mode(&target, mode & 0o7777).map_err(|e| io_err("unpack", &target, e))?;
        }
        files += 1;
    }

    for (dir, mode) in dir_modes.into_iter().rev() {
        set_mode(&dir, mode).map_err(|e| io_err("unpack", &dir, e))?;
    }

    Ok(files)
}

fn storage_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(500),
        ..Default::default()
    }
}

/// Restore a project archive into the volume at `root`
///
/// A missing archive is the normal state of a never-hibernated project and
/// yields [`HydrationOutcome::Fresh`]. `wait` bounds how long a hydrator that
/// lost the lock waits for the winner; on timeout the stale lock is removed so
/// the next attempt can take it.
#[instrument(skip(store), fields(root = %root.display()))]
pub async fn hydrate(
    store: &dyn ObjectStore,
    root: &Path,
    key: &str,
    wait: Duration,
) -> Result<HydrationOutcome> {
    let state_dir = root.join(STATE_DIR);
    let marker = state_dir.join(HYDRATED_MARKER);
    let lock = state_dir.join(HYDRATION_LOCK);
    fs::create_dir_all(&state_dir).map_err(|e| io_err("hydrate", &state_dir, e))?;

    if marker.exists() {
        info!("volume already hydrated");
        return Ok(HydrationOutcome::AlreadyHydrated);
    }

    match claim_lock(&marker, &lock)? {
        Claim::Won => {}
        Claim::HeldByPeer => return wait_for_peer(&marker, &lock, wait).await,
        Claim::Done => {
            info!("volume hydrated by a peer");
            return Ok(HydrationOutcome::AlreadyHydrated);
        }
    }

    let result = match restore(store, root, key).await {
        Ok(outcome) => fs::write(&marker, chrono::Utc::now().to_rfc3339())
            .map(|()| outcome)
            .map_err(|e| io_err("hydrate", &marker, e)),
        Err(e) => Err(e),
    };
    release_lock(&lock);
    result
}

#[derive(Debug, PartialEq, Eq)]
enum Claim {
    Won,
    HeldByPeer,
    Done,
}

fn claim_lock(marker: &Path, lock: &Path) -> Result<Claim> {
    match OpenOptions::new().write(true).create_new(true).open(lock) {
        Ok(mut file) => {
            if let Err(e) = writeln!(file, "{}", std::process::id()) {
                release_lock(lock);
                return Err(io_err("hydrate", lock, e));
            }
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(Claim::HeldByPeer),
        Err(e) => return Err(io_err("hydrate", lock, e)),
    }

    // A peer may have finished between the marker check and taking the lock
    if marker.exists() {
        release_lock(lock);
        return Ok(Claim::Done);
    }
    Ok(Claim::Won)
}

fn release_lock(lock: &Path) {
    if let Err(e) = fs::remove_file(lock) {
        warn!(error = %e, "failed to release hydration lock");
    }
}

async fn restore(store: &dyn ObjectStore, root: &Path, key: &str) -> Result<HydrationOutcome> {
    let fetched = retry_with_backoff(&storage_retry(), "fetch archive", StorageError::is_retryable, || {
        store.get(key)
    })
    .await;

    let bytes = match fetched {
        Ok((bytes, _)) => bytes,
        Err(e) if e.error.is_not_found() => {
            info!(key, "no archive yet, starting with an empty volume");
            return Ok(HydrationOutcome::Fresh);
        }
        Err(e) => return Err(e.error.into()),
    };

    let size = bytes.len() as u64;
    let target = root.to_path_buf();
    let files = tokio::task::spawn_blocking(move || unpack_into(&bytes, &target))
        .await
        .map_err(|e| Error::internal_with_context("hydrate", e.to_string()))??;
    info!(key, size, files, "restored archive");
    Ok(HydrationOutcome::Restored { bytes: size })
}

async fn wait_for_peer(marker: &Path, lock: &Path, wait: Duration) -> Result<HydrationOutcome> {
    info!("another hydrator holds the lock, waiting");
    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        if marker.exists() {
            return Ok(HydrationOutcome::RestoredByPeer);
        }
        if !lock.exists() {
            // The holder failed and released the lock without a marker
            return Err(Error::archive("hydrate", "peer hydration did not complete"));
        }
        tokio::time::sleep(WAIT_POLL).await;
    }
    if let Err(e) = fs::remove_file(lock) {
        warn!(error = %e, "failed to remove stale hydration lock");
    }
    Err(Error::timeout("peer hydration"))
}

/// Archive the volume at `root` and upload it, returning the archive size
///
/// The archive is staged in a temporary file outside the volume and uploaded
/// from disk, so memory use does not grow with the workspace.
#[instrument(skip(store), fields(root = %root.display()))]
pub async fn dehydrate(store: &dyn ObjectStore, root: &Path, key: &str) -> Result<u64> {
    let source = root.to_path_buf();
    let staged = tokio::task::spawn_blocking(move || -> Result<NamedTempFile> {
        let file = NamedTempFile::new().map_err(|e| Error::archive("dehydrate", e.to_string()))?;
        let mut file = pack_into(&source, file)?;
        if let Err(e) = file.flush() {
            return Err(io_err("dehydrate", file.path(), e));
        }
        Ok(file)
    })
    .await
    .map_err(|e| Error::internal_with_context("dehydrate", e.to_string()))??;
    let size = staged
        .as_file()
        .metadata()
        .map_err(|e| io_err("dehydrate", staged.path(), e))?
        .len();

    retry_with_backoff(&storage_retry(), "upload archive", StorageError::is_retryable, || {
        store.put_file(key, staged.path())
    })
    .await
    .map_err(|e| Error::from(e.error))?;

    info!(key, size, "uploaded archive");
    Ok(size)
}

/// Copy the running executable into `dir`, returning the installed path
pub fn install_binary(dir: &Path, name: &str) -> Result<PathBuf> {
    let source = std::env::current_exe().map_err(|e| Error::archive("install", e.to_string()))?;
    fs::create_dir_all(dir).map_err(|e| io_err("install", dir, e))?;
    let target = dir.join(name);
    let mut input = File::open(&source).map_err(|e| io_err("install", &source, e))?;
    let mut buf = Vec::new();
    input
        .read_to_end(&mut buf)
        .map_err(|e| io_err("install", &source, e))?;
    fs::write(&target, buf).map_err(|e| io_err("install", &target, e))?;
    set_mode(&target, 0o755).map_err(|e| io_err("install", &target, e))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::archive_key;
    use crate::storage::memory::InMemoryObjectStore;
    use uuid::Uuid;

    fn write(root: &Path, rel: &str, body: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    // ==========================================================================
    // Story Tests: Archive round trip
    // ==========================================================================

    /// Story: a 500 byte source file survives dehydrate then hydrate into a
    /// fresh volume, and exactly one object is written at the project key
    #[tokio::test]
    async fn story_app_source_round_trip() {
        let store = InMemoryObjectStore::new();
        let key = archive_key(Uuid::new_v4(), Uuid::new_v4());
        let source = tempfile::tempdir().unwrap();
        let body: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        write(source.path(), "frontend/src/App.jsx", &body);

        let size = dehydrate(&store, source.path(), &key).await.unwrap();
        assert_eq!(store.keys(), vec![key.clone()]);
        assert_eq!(store.object(&key).unwrap().len() as u64, size);

        let fresh = tempfile::tempdir().unwrap();
        let outcome = hydrate(&store, fresh.path(), &key, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, HydrationOutcome::Restored { bytes: size });
        let restored = fs::read(fresh.path().join("frontend/src/App.jsx")).unwrap();
        assert_eq!(restored.len(), 500);
        assert_eq!(restored, body);
    }

    /// Story: a never-hibernated project hydrates to an empty volume
    #[tokio::test]
    async fn story_missing_archive_is_fresh() {
        let store = InMemoryObjectStore::new();
        let volume = tempfile::tempdir().unwrap();
        let outcome = hydrate(&store, volume.path(), "projects/u/p/latest.zip", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, HydrationOutcome::Fresh);
        assert!(volume.path().join(STATE_DIR).join(HYDRATED_MARKER).exists());
        assert!(!volume.path().join(STATE_DIR).join(HYDRATION_LOCK).exists());
    }

    /// Story: a restart never rolls live data back to the archive
    #[tokio::test]
    async fn story_hydrated_volume_is_left_alone() {
        let store = InMemoryObjectStore::new();
        let volume = tempfile::tempdir().unwrap();
        write(volume.path(), "a.txt", b"old");
        let key = "projects/u/p/latest.zip";
        dehydrate(&store, volume.path(), key).await.unwrap();

        hydrate(&store, volume.path(), key, Duration::from_secs(1))
            .await
            .unwrap();
        write(volume.path(), "a.txt", b"new");

        let outcome = hydrate(&store, volume.path(), key, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, HydrationOutcome::AlreadyHydrated);
        assert_eq!(fs::read(volume.path().join("a.txt")).unwrap(), b"new");
    }

    /// Story: a hydrator that loses the lock waits for the winner's marker
    #[tokio::test]
    async fn story_peer_hydration_is_awaited() {
        let store = InMemoryObjectStore::new();
        let volume = tempfile::tempdir().unwrap();
        let state = volume.path().join(STATE_DIR);
        fs::create_dir_all(&state).unwrap();
        fs::write(state.join(HYDRATION_LOCK), "1").unwrap();

        let marker = state.join(HYDRATED_MARKER);
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            fs::write(marker, "done").unwrap();
        });

        let outcome = hydrate(&store, volume.path(), "k", Duration::from_secs(5))
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(outcome, HydrationOutcome::RestoredByPeer);
    }

    /// Story: a stale lock times out and is cleared for the next attempt
    #[tokio::test]
    async fn story_stale_lock_times_out() {
        let store = InMemoryObjectStore::new();
        let volume = tempfile::tempdir().unwrap();
        let state = volume.path().join(STATE_DIR);
        fs::create_dir_all(&state).unwrap();
        fs::write(state.join(HYDRATION_LOCK), "1").unwrap();

        let err = hydrate(&store, volume.path(), "k", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(!state.join(HYDRATION_LOCK).exists());

        let outcome = hydrate(&store, volume.path(), "k", Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, HydrationOutcome::Fresh);
    }

    /// Story: a hydrator that takes the lock after a peer already finished
    /// leaves the volume alone
    #[test]
    fn story_lock_taken_after_peer_finished_is_released() {
        let volume = tempfile::tempdir().unwrap();
        let state = volume.path().join(STATE_DIR);
        fs::create_dir_all(&state).unwrap();
        let marker = state.join(HYDRATED_MARKER);
        let lock = state.join(HYDRATION_LOCK);

        assert_eq!(claim_lock(&marker, &lock).unwrap(), Claim::Won);
        assert_eq!(claim_lock(&marker, &lock).unwrap(), Claim::HeldByPeer);
        fs::remove_file(&lock).unwrap();

        fs::write(&marker, "done").unwrap();
        assert_eq!(claim_lock(&marker, &lock).unwrap(), Claim::Done);
        assert!(!lock.exists());
    }

    // ==========================================================================
    // Story Tests: Pack and unpack
    // ==========================================================================

    #[test]
    fn story_state_dir_is_not_archived() {
        let volume = tempfile::tempdir().unwrap();
        write(volume.path(), "backend/main.py", b"print('hi')");
        write(volume.path(), ".canopy/hydrated", b"x");

        let bytes = pack_dir(volume.path()).unwrap();
        let archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert!(names.contains(&"backend/main.py"));
        assert!(!names.iter().any(|n| n.starts_with(".canopy")));
    }

    #[test]
    fn story_entries_escaping_the_volume_are_skipped() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.start_file("../escape.txt", options).unwrap();
        writer.write_all(b"nope").unwrap();
        writer.start_file("ok.txt", options).unwrap();
        writer.write_all(b"yes").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let parent = tempfile::tempdir().unwrap();
        let volume = parent.path().join("volume");
        fs::create_dir_all(&volume).unwrap();
        let files = unpack_into(&bytes, &volume).unwrap();

        assert_eq!(files, 1);
        assert!(volume.join("ok.txt").exists());
        assert!(!parent.path().join("escape.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn story_executable_bits_survive() {
        use std::os::unix::fs::PermissionsExt;
        let volume = tempfile::tempdir().unwrap();
        write(volume.path(), "scripts/run.sh", b"#!/bin/sh\n");
        set_mode(&volume.path().join("scripts/run.sh"), 0o755).unwrap();

        let bytes = pack_dir(volume.path()).unwrap();
        let fresh = tempfile::tempdir().unwrap();
        unpack_into(&bytes, fresh.path()).unwrap();
        let mode = fs::metadata(fresh.path().join("scripts/run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    /// Story: package manager shims are links and must come back as links,
    /// together with the executable bit of what they point at
    #[cfg(unix)]
    #[tokio::test]
    async fn story_symlinks_survive_round_trip() {
        use std::os::unix::fs::PermissionsExt;
        let store = InMemoryObjectStore::new();
        let volume = tempfile::tempdir().unwrap();
        write(volume.path(), "frontend/node_modules/vite/bin/vite.js", b"#!/usr/bin/env node\n");
        set_mode(&volume.path().join("frontend/node_modules/vite/bin/vite.js"), 0o755).unwrap();
        fs::create_dir_all(volume.path().join("frontend/node_modules/.bin")).unwrap();
        std::os::unix::fs::symlink(
            "../vite/bin/vite.js",
            volume.path().join("frontend/node_modules/.bin/vite"),
        )
        .unwrap();

        dehydrate(&store, volume.path(), "k").await.unwrap();
        let fresh = tempfile::tempdir().unwrap();
        hydrate(&store, fresh.path(), "k", Duration::from_secs(1))
            .await
            .unwrap();

        let link = fresh.path().join("frontend/node_modules/.bin/vite");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("../vite/bin/vite.js"));
        assert_eq!(fs::read(&link).unwrap(), b"#!/usr/bin/env node\n");
        let mode = fs::metadata(&link).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn story_links_leaving_the_volume_are_skipped() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.add_symlink("up", "../../etc", options).unwrap();
        writer.add_symlink("abs", "/etc/passwd", options).unwrap();
        writer.add_symlink("web/current", "../a.txt", options).unwrap();
        writer.start_file("a.txt", options).unwrap();
        writer.write_all(b"a").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let volume = tempfile::tempdir().unwrap();
        let files = unpack_into(&bytes, volume.path()).unwrap();

        assert_eq!(files, 2);
        assert!(fs::symlink_metadata(volume.path().join("up")).is_err());
        assert!(fs::symlink_metadata(volume.path().join("abs")).is_err());
        assert_eq!(fs::read(volume.path().join("web/current")).unwrap(), b"a");
    }

    #[cfg(unix)]
    #[test]
    fn story_entries_behind_a_link_are_skipped() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.add_symlink("cache", "store", options).unwrap();
        writer.start_file("cache/blob", options).unwrap();
        writer.write_all(b"x").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let volume = tempfile::tempdir().unwrap();
        fs::create_dir_all(volume.path().join("store")).unwrap();
        let files = unpack_into(&bytes, volume.path()).unwrap();

        assert_eq!(files, 1);
        assert!(!volume.path().join("store/blob").exists());
    }

    #[cfg(unix)]
    #[test]
    fn story_read_only_directories_are_filled() {
        use std::os::unix::fs::PermissionsExt;
        let volume = tempfile::tempdir().unwrap();
        write(volume.path(), "vendor/lib.rs", b"pub fn f() {}");
        set_mode(&volume.path().join("vendor"), 0o555).unwrap();
        let bytes = pack_dir(volume.path()).unwrap();
        set_mode(&volume.path().join("vendor"), 0o755).unwrap();

        let fresh = tempfile::tempdir().unwrap();
        unpack_into(&bytes, fresh.path()).unwrap();

        assert_eq!(fs::read(fresh.path().join("vendor/lib.rs")).unwrap(), b"pub fn f() {}");
        let mode = fs::metadata(fresh.path().join("vendor")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);
        set_mode(&fresh.path().join("vendor"), 0o755).unwrap();
    }

    #[tokio::test]
    async fn story_upload_retries_transient_failures() {
        let store = InMemoryObjectStore::new();
        store.fail_puts(1);
        let volume = tempfile::tempdir().unwrap();
        write(volume.path(), "x", b"1");
        let size = dehydrate(&store, volume.path(), "k").await.unwrap();
        assert_eq!(store.put_count(), 1);
        assert_eq!(store.object("k").unwrap().len() as u64, size);
    }
}
