use std::collections::HashMap;
use std::collections::hash_map::Entry;

use bitvec::prelude::{BitVec, Lsb0};
use model::{CHUNK_PIXELS, ChunkKey, PaletteRef, Pixel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFetchState {
    Pending,
    Resolved,
    Failed,
}

/// Outcome of an `ensure` call, mostly for collaborators that want to know
/// whether a network request was actually dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Requested,
    AlreadyPending,
    AlreadyResolved,
}

/// One fixed-size spatial region of the canvas.
///
/// `base` is the committed snapshot fetched once from the persistence
/// collaborator; `overlay` marks local offsets currently shown from the
/// action log instead of the base. `base_present` distinguishes a committed
/// transparent pixel from a coordinate the server never reported.
#[derive(Debug)]
pub struct Chunk {
    state: ChunkFetchState,
    base: Box<[PaletteRef]>,
    base_present: BitVec<usize, Lsb0>,
    overlay: BitVec<usize, Lsb0>,
}

impl Chunk {
    fn new_pending() -> Self {
        Self {
            state: ChunkFetchState::Pending,
            base: vec![PaletteRef::TRANSPARENT; CHUNK_PIXELS].into_boxed_slice(),
            base_present: BitVec::repeat(false, CHUNK_PIXELS),
            overlay: BitVec::repeat(false, CHUNK_PIXELS),
        }
    }

    pub fn state(&self) -> ChunkFetchState {
        self.state
    }

    /// Committed color at a local index, ignoring any overlay.
    pub fn base_value(&self, local_index: usize) -> Option<PaletteRef> {
        if self.base_present[local_index] {
            Some(self.base[local_index])
        } else {
            None
        }
    }

    pub fn overlay_is_set(&self, local_index: usize) -> bool {
        self.overlay[local_index]
    }

    fn merge_base(&mut self, local_index: usize, color: PaletteRef) {
        self.base[local_index] = color;
        self.base_present.set(local_index, true);
    }
}

/// Spatial cache of fixed-size regions, keyed by floor-aligned origin.
///
/// All chunk mutation goes through `ensure` / `on_fetch_resolved` /
/// `on_fetch_failed` / `unset` / `write_back`; chunks live in this single
/// keyed map and nowhere else. Fetch dispatch is modeled as a request queue
/// the network collaborator drains, so the store itself stays synchronous.
#[derive(Debug, Default)]
pub struct ChunkStore {
    chunks: HashMap<ChunkKey, Chunk>,
    pending_fetches: Vec<ChunkKey>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the chunk and enqueue its fetch on first need. Idempotent:
    /// a pending or resolved chunk never triggers a second request, a
    /// failed chunk is re-requested (retry is the caller's decision).
    pub fn ensure(&mut self, key: ChunkKey) -> EnsureOutcome {
        match self.chunks.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(Chunk::new_pending());
                self.pending_fetches.push(key);
                EnsureOutcome::Requested
            }
            Entry::Occupied(mut entry) => match entry.get().state {
                ChunkFetchState::Pending => EnsureOutcome::AlreadyPending,
                ChunkFetchState::Resolved => EnsureOutcome::AlreadyResolved,
                ChunkFetchState::Failed => {
                    entry.get_mut().state = ChunkFetchState::Pending;
                    self.pending_fetches.push(key);
                    EnsureOutcome::Requested
                }
            },
        }
    }

    /// Fetch requests accumulated since the last drain, in request order.
    pub fn drain_fetch_requests(&mut self) -> Vec<ChunkKey> {
        std::mem::take(&mut self.pending_fetches)
    }

    /// Merge committed pixels into the chunk's base bitmap. A result for an
    /// evicted chunk is discarded; pixels outside the chunk are skipped.
    pub fn on_fetch_resolved(&mut self, key: ChunkKey, pixels: &[Pixel]) {
        let Some(chunk) = self.chunks.get_mut(&key) else {
            return;
        };
        for pixel in pixels {
            if let Some(local_index) = key.local_index(pixel.x, pixel.y) {
                chunk.merge_base(local_index, pixel.color);
            }
        }
        chunk.state = ChunkFetchState::Resolved;
    }

    /// A failed fetch leaves the chunk permanently empty until a
    /// collaborator re-invokes `ensure`. Never an error.
    pub fn on_fetch_failed(&mut self, key: ChunkKey) {
        if let Some(chunk) = self.chunks.get_mut(&key) {
            if chunk.state == ChunkFetchState::Pending {
                chunk.state = ChunkFetchState::Failed;
            }
        }
    }

    /// Mark coordinates as currently owned by the action log.
    pub fn mark_overlay(&mut self, pixels: &[Pixel]) {
        for pixel in pixels {
            let key = pixel.chunk_key();
            if let Some(chunk) = self.chunks.get_mut(&key) {
                let local_index = key
                    .local_index(pixel.x, pixel.y)
                    .expect("pixel chunk key covers its own coordinate");
                chunk.overlay.set(local_index, true);
            }
        }
    }

    /// Clear overlay bits so the base bitmap shows through again. This is
    /// how an undo reverts a pixel without a server round trip: anything
    /// absent from the in-memory log is already committed in the base.
    pub fn unset(&mut self, pixels: &[Pixel]) {
        for pixel in pixels {
            let key = pixel.chunk_key();
            if let Some(chunk) = self.chunks.get_mut(&key) {
                let local_index = key
                    .local_index(pixel.x, pixel.y)
                    .expect("pixel chunk key covers its own coordinate");
                chunk.overlay.set(local_index, false);
            }
        }
    }

    /// Merge now-committed pixels into their base bitmaps and release the
    /// overlay claim on those coordinates.
    pub fn write_back(&mut self, pixels: &[Pixel]) {
        for pixel in pixels {
            let key = pixel.chunk_key();
            if let Some(chunk) = self.chunks.get_mut(&key) {
                let local_index = key
                    .local_index(pixel.x, pixel.y)
                    .expect("pixel chunk key covers its own coordinate");
                chunk.merge_base(local_index, pixel.color);
                chunk.overlay.set(local_index, false);
            }
        }
    }

    /// Committed color beneath any in-flight local edits; `None` when the
    /// chunk is absent, unresolved at that offset, or never reported.
    pub fn get_pixel_value(&self, x: i32, y: i32) -> Option<PaletteRef> {
        let key = ChunkKey::containing(x, y);
        let chunk = self.chunks.get(&key)?;
        let local_index = key
            .local_index(x, y)
            .expect("containing chunk key covers the coordinate");
        chunk.base_value(local_index)
    }

    pub fn overlay_is_set(&self, x: i32, y: i32) -> bool {
        let key = ChunkKey::containing(x, y);
        let Some(chunk) = self.chunks.get(&key) else {
            return false;
        };
        let local_index = key
            .local_index(x, y)
            .expect("containing chunk key covers the coordinate");
        chunk.overlay_is_set(local_index)
    }

    pub fn chunk(&self, key: ChunkKey) -> Option<&Chunk> {
        self.chunks.get(&key)
    }

    pub fn chunk_state(&self, key: ChunkKey) -> Option<ChunkFetchState> {
        self.chunks.get(&key).map(Chunk::state)
    }

    /// Drop a chunk entirely. A fetch result arriving afterwards is
    /// discarded by `on_fetch_resolved`.
    pub fn evict(&mut self, key: ChunkKey) {
        self.chunks.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
