// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Compiled-rule cache.
//!
//! Parsing and checking a rule base is expensive, so the compiled form is
//! published as a postcard image in a segment shared by every process on
//! the host. A header records which set id the image was built from, the
//! files it was compiled from (those pulled in by `@include` too), their
//! blake3 hash and their latest modification time. A
//! process reuses the image only when all of them match; otherwise it
//! rebuilds and republishes. Concurrent rebuilders are not coordinated and
//! the last writer wins.

use crate::config::EngineConfig;
use crate::error::RuleError;
use crate::rule_base::CompiledRuleBase;
use crate::*;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::UNIX_EPOCH;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Identifies the build that wrote an image. Images of other builds are
/// never decoded.
const BUILD_ID: &str = env!("RULEBASE_BUILD_ID");

/// Content hash and latest modification time of the files of a rule base,
/// included files among them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: [u8; 32],
    /// Nanoseconds since the epoch.
    pub mtime: u128,
}

#[derive(Default)]
struct FingerprintBuilder {
    hasher: blake3::Hasher,
    mtime: u128,
}

impl FingerprintBuilder {
    fn add(&mut self, path: &Path, contents: &[u8]) -> Result<()> {
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| RuleError::FileStat(format!("{}: {e}", path.display())))?;
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        self.mtime = self.mtime.max(nanos);
        let name = path.to_string_lossy();
        self.hasher.update(&(name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update(&(contents.len() as u64).to_le_bytes());
        self.hasher.update(contents);
        Ok(())
    }

    fn finish(self) -> Fingerprint {
        Fingerprint {
            hash: *self.hasher.finalize().as_bytes(),
            mtime: self.mtime,
        }
    }
}

impl Fingerprint {
    /// Fingerprint of `files` as they are now on disk.
    pub fn of(files: &[PathBuf]) -> Result<Self> {
        let mut builder = FingerprintBuilder::default();
        for path in files {
            let contents = fs::read(path).map_err(|e| RuleError::FileStat(format!("{}: {e}", path.display())))?;
            builder.add(path, &contents)?;
        }
        Ok(builder.finish())
    }

    /// Fingerprint of the text `base` was compiled from. A file edited
    /// after it was parsed no longer matches.
    pub fn of_compiled(base: &CompiledRuleBase) -> Result<Self> {
        let mut builder = FingerprintBuilder::default();
        for source in base.ast().sources().iter().filter(|s| !s.is_synthesized()) {
            builder.add(Path::new(source.file()), source.contents().as_bytes())?;
        }
        Ok(builder.finish())
    }

    /// Whether `files` still have this fingerprint.
    fn matches(&self, files: &[PathBuf]) -> bool {
        Self::of(files).is_ok_and(|f| f == *self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub populated: bool,
    pub build: String,
    pub set_id: String,
    /// Every file the image was compiled from.
    pub files: Vec<PathBuf>,
    pub fingerprint: Fingerprint,
    /// blake3 hash of the image, to detect a torn read.
    pub image_hash: [u8; 32],
}

impl SegmentHeader {
    fn describes(&self, set_id: &str) -> bool {
        self.populated
            && self.build == BUILD_ID
            && self.set_id == set_id
            && self.fingerprint.matches(&self.files)
    }
}

/// Storage shared between processes holding at most one image.
pub trait SharedSegment {
    /// The current header, if the segment has been written.
    fn header(&self) -> Result<Option<SegmentHeader>>;

    fn image(&self) -> Result<Vec<u8>>;

    /// Replace the contents. The image is written before the header.
    fn publish(&self, header: &SegmentHeader, image: &[u8]) -> Result<()>;
}

/// Segment kept in process memory.
#[derive(Debug, Default)]
pub struct MemorySegment {
    inner: Mutex<Option<(SegmentHeader, Vec<u8>)>>,
}

impl MemorySegment {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedSegment for MemorySegment {
    fn header(&self) -> Result<Option<SegmentHeader>> {
        Ok(self.inner.lock().as_ref().map(|(h, _)| h.clone()))
    }

    fn image(&self) -> Result<Vec<u8>> {
        match self.inner.lock().as_ref() {
            Some((_, image)) => Ok(image.clone()),
            None => bail!(RuleError::SegmentUnavailable("segment is empty".to_string())),
        }
    }

    fn publish(&self, header: &SegmentHeader, image: &[u8]) -> Result<()> {
        *self.inner.lock() = Some((header.clone(), image.to_vec()));
        Ok(())
    }
}

/// Segment stored as files under a directory, `/dev/shm` by default.
/// Access is serialized with an OS file lock on `<name>.lock`.
#[derive(Debug, Clone)]
pub struct FileSegment {
    dir: PathBuf,
    name: String,
}

fn unavailable(what: &str, e: impl core::fmt::Display) -> anyhow::Error {
    RuleError::SegmentUnavailable(format!("{what}: {e}")).into()
}

impl FileSegment {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            dir: config.segment_dir(),
            name: config.segment_name.clone(),
        }
    }

    fn path(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", self.name))
    }

    fn lock_file(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.path("lock"))
            .map_err(|e| unavailable("cannot open segment lock", e))
    }

    fn read_locked(&self, ext: &str) -> Result<Option<Vec<u8>>> {
        let lock = self.lock_file()?;
        lock.lock_shared()
            .map_err(|e| unavailable("cannot lock segment", e))?;
        let r = match fs::read(self.path(ext)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable("cannot read segment", e)),
        };
        let _ = lock.unlock();
        r
    }
}

fn write_file(path: &PathBuf, bytes: &[u8]) -> Result<()> {
    let mut f = File::create(path).map_err(|e| unavailable("cannot create segment file", e))?;
    f.write_all(bytes)
        .and_then(|_| f.sync_all())
        .map_err(|e| unavailable("cannot write segment file", e))
}

impl SharedSegment for FileSegment {
    fn header(&self) -> Result<Option<SegmentHeader>> {
        match self.read_locked("hdr")? {
            Some(bytes) => Ok(Some(
                postcard::from_bytes(&bytes).map_err(|e| unavailable("corrupt segment header", e))?,
            )),
            None => Ok(None),
        }
    }

    fn image(&self) -> Result<Vec<u8>> {
        match self.read_locked("img")? {
            Some(bytes) => Ok(bytes),
            None => bail!(unavailable("segment image", "missing")),
        }
    }

    fn publish(&self, header: &SegmentHeader, image: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| unavailable("cannot create segment directory", e))?;
        let header = postcard::to_allocvec(header).map_err(|e| unavailable("cannot encode header", e))?;
        let lock = self.lock_file()?;
        lock.lock().map_err(|e| unavailable("cannot lock segment", e))?;
        let r = write_file(&self.path("img"), image).and_then(|_| write_file(&self.path("hdr"), &header));
        let _ = lock.unlock();
        r
    }
}

/// Observes rebuilds of rule bases.
pub trait BuildCounter {
    fn record_build(&self, set_id: &str);
}

/// Counts rebuilds.
#[derive(Debug, Default)]
pub struct BuildCount {
    builds: AtomicUsize,
}

impl BuildCount {
    pub fn count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl BuildCounter for BuildCount {
    fn record_build(&self, _set_id: &str) {
        self.builds.fetch_add(1, Ordering::SeqCst);
    }
}

/// A `BuildCounter` that ignores rebuilds.
#[derive(Debug, Default)]
pub struct NoCount;

impl BuildCounter for NoCount {
    fn record_build(&self, _set_id: &str) {}
}

struct MemoEntry {
    files: Vec<PathBuf>,
    fingerprint: Fingerprint,
    base: Rc<CompiledRuleBase>,
}

pub struct RuleCache {
    config: EngineConfig,
    segment: Box<dyn SharedSegment>,
    counter: Rc<dyn BuildCounter>,
    memo: HashMap<String, MemoEntry>,
}

impl RuleCache {
    pub fn new(config: EngineConfig, segment: Box<dyn SharedSegment>, counter: Rc<dyn BuildCounter>) -> Self {
        Self {
            config,
            segment,
            counter,
            memo: HashMap::new(),
        }
    }

    /// Cache backed by a `FileSegment` as configured.
    pub fn from_config(config: &EngineConfig) -> Self {
        let segment = FileSegment::new(config);
        Self::new(config.clone(), Box::new(segment), Rc::new(NoCount))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compiled rule base of `set_id`, from the in-process memo, the shared
    /// segment or a fresh build, in that order.
    pub fn load(&mut self, set_id: &str) -> Result<Rc<CompiledRuleBase>> {
        if let Some(entry) = self.memo.get(set_id) {
            if entry.fingerprint.matches(&entry.files) {
                debug!(set_id, "rule base served from memo");
                return Ok(entry.base.clone());
            }
        }

        let (base, fingerprint) = match self.from_segment(set_id) {
            Ok(Some(hit)) => {
                debug!(set_id, "rule base served from shared segment");
                hit
            }
            Ok(None) => self.rebuild(set_id)?,
            Err(e) => {
                warn!(set_id, "shared segment unusable, rebuilding: {e}");
                self.rebuild(set_id)?
            }
        };
        let base = Rc::new(base);
        self.memo.insert(
            set_id.to_string(),
            MemoEntry {
                files: base.files(),
                fingerprint,
                base: base.clone(),
            },
        );
        Ok(base)
    }

    fn from_segment(&self, set_id: &str) -> Result<Option<(CompiledRuleBase, Fingerprint)>> {
        let header = match self.segment.header()? {
            Some(h) if h.describes(set_id) => h,
            _ => return Ok(None),
        };
        let image = self.segment.image()?;
        if *blake3::hash(&image).as_bytes() != header.image_hash {
            // Overwritten between reading the header and the image.
            return Ok(None);
        }
        match postcard::from_bytes(&image) {
            Ok(base) => Ok(Some((base, header.fingerprint))),
            Err(e) => bail!(unavailable("corrupt segment image", e)),
        }
    }

    fn rebuild(&self, set_id: &str) -> Result<(CompiledRuleBase, Fingerprint)> {
        self.counter.record_build(set_id);
        let base = CompiledRuleBase::build(&self.config, set_id)?;
        let fingerprint = Fingerprint::of_compiled(&base)?;
        match postcard::to_allocvec(&base) {
            Ok(image) => {
                let header = SegmentHeader {
                    populated: true,
                    build: BUILD_ID.to_string(),
                    set_id: set_id.to_string(),
                    files: base.files(),
                    fingerprint,
                    image_hash: *blake3::hash(&image).as_bytes(),
                };
                match self.segment.publish(&header, &image) {
                    Ok(()) => info!(set_id, bytes = image.len(), "published compiled rule base"),
                    Err(e) => warn!(set_id, "unable to publish compiled rule base: {e}"),
                }
            }
            Err(e) => warn!(set_id, "unable to encode compiled rule base: {e}"),
        }
        Ok((base, fingerprint))
    }

    /// Forget the memoized rule base of `set_id`.
    pub fn invalidate(&mut self, set_id: &str) {
        self.memo.remove(set_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("rulebase-cache-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    #[test]
    fn file_segment_round_trip() -> Result<()> {
        let dir = scratch_dir("segment")?;
        let config = EngineConfig {
            cache_dir: Some(dir.clone()),
            ..EngineConfig::default()
        };
        let segment = FileSegment::new(&config);
        assert!(segment.header()?.is_none());
        let header = SegmentHeader {
            populated: true,
            build: BUILD_ID.to_string(),
            set_id: "core".to_string(),
            files: vec![dir.join("core.re")],
            fingerprint: Fingerprint {
                hash: [7; 32],
                mtime: 42,
            },
            image_hash: *blake3::hash(b"image").as_bytes(),
        };
        segment.publish(&header, b"image")?;
        assert_eq!(segment.header()?, Some(header));
        assert_eq!(segment.image()?, b"image");
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn missing_rule_file_is_a_stat_error() -> Result<()> {
        let dir = scratch_dir("missing")?;
        let config = EngineConfig {
            rule_base_dir: dir.clone(),
            ..EngineConfig::default()
        };
        let err = Fingerprint::of(&[config.rule_file("absent")]).err();
        let code = err.map(|e| RuleError::from_anyhow(&e).code());
        assert_eq!(code, Some(crate::error::codes::RE_FILE_STAT_ERROR));
        fs::remove_dir_all(dir)?;
        Ok(())
    }
}
