//! Canvases kept on disk between runs, one JSON file per slot.

use log::{debug, trace, warn};
use room_core::envelope::base64_bytes;
use room_core::{CanvasId, CanvasState, Error, CANVAS_CACHE_TTL};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct CachedCanvas {
    canvas_id: CanvasId,
    #[serde(with = "base64_bytes")]
    image: Vec<u8>,
    updated_at_millis: u64,
    cached_at_millis: u64,
}

/// Expiring on-disk canvas store
#[derive(Debug, Clone)]
pub struct CanvasCache {
    dir: PathBuf,
    ttl: Duration,
}

impl CanvasCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_ttl(dir, CANVAS_CACHE_TTL)
    }

    pub fn with_ttl(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, canvas_id: &CanvasId) -> PathBuf {
        let name: String = canvas_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }

    /// Cached content of `canvas_id`, or `None` if absent or expired.
    /// Expired and unreadable entries are deleted.
    pub fn load(&self, canvas_id: &CanvasId, now_millis: u64) -> Result<Option<CanvasState>, Error> {
        let path = self.path_for(canvas_id);
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read cached canvas {:?}: {}", path, e)))?;
        let cached: CachedCanvas = match serde_json::from_str(&contents) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Discarding unreadable cached canvas {:?}: {}", path, e);
                self.discard(&path);
                return Ok(None);
            }
        };

        let age = now_millis.saturating_sub(cached.cached_at_millis);
        if age > self.ttl.as_millis() as u64 || &cached.canvas_id != canvas_id {
            debug!("Cached canvas {} expired", canvas_id);
            self.discard(&path);
            return Ok(None);
        }

        Ok(Some(CanvasState {
            canvas_id: cached.canvas_id,
            image: cached.image,
            updated_at_millis: cached.updated_at_millis,
        }))
    }

    /// Write `canvas` to disk, stamped with `now_millis`
    pub fn store(&self, canvas: &CanvasState, now_millis: u64) -> Result<(), Error> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Config(format!("Failed to create cache directory: {}", e)))?;

        let cached = CachedCanvas {
            canvas_id: canvas.canvas_id.clone(),
            image: canvas.image.clone(),
            updated_at_millis: canvas.updated_at_millis,
            cached_at_millis: now_millis,
        };
        let json = serde_json::to_string(&cached)
            .map_err(|e| Error::Serialization(format!("Failed to encode cached canvas: {}", e)))?;

        let path = self.path_for(&canvas.canvas_id);
        fs::write(&path, json)
            .map_err(|e| Error::Config(format!("Failed to write cached canvas {:?}: {}", path, e)))?;
        trace!("Cached canvas {} at {:?}", canvas.canvas_id, path);
        Ok(())
    }

    fn discard(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}
