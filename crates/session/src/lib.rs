//! Merge coordinator for the pixel-canvas core.
//!
//! `CanvasSession` owns the action log and the chunk store and keeps them
//! consistent across local edits, undo/redo, remote ingestion, and lazily
//! fetched chunk data. Every mutation runs synchronously: append or control
//! marker in, one recompute pass (resolve, derive, unset), back to idle.

use std::collections::HashMap;

use chunks::{ChunkFetchState, ChunkStore, EnsureOutcome};
use history::{Action, ActionId, ActionLog, ActionValidationError, PaintAction};
use model::{ChunkKey, DedupKey, PaletteRef, Pixel, Point, dedup_last_wins};
use protocol::trace::{MutationKind, MutationTraceRecorder};
use protocol::{ChunkFetchRequest, OutboundWrite, RemotePixelBatch};

pub struct CanvasSession {
    log: ActionLog,
    chunks: ChunkStore,
    outbound: Vec<OutboundWrite>,
    /// Actions undone and not yet redone, newest last. Pinned explicitly
    /// instead of re-derived from the fold so redo can never replay the
    /// wrong action; cleared whenever a new edit enters the log, mirroring
    /// the fold's own redo-discard rule.
    redo_targets: Vec<ActionId>,
    next_action_id: u64,
    trace: Option<MutationTraceRecorder>,
}

impl Default for CanvasSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasSession {
    pub fn new() -> Self {
        Self {
            log: ActionLog::new(),
            chunks: ChunkStore::new(),
            outbound: Vec::new(),
            redo_targets: Vec::new(),
            next_action_id: 1,
            trace: None,
        }
    }

    pub fn with_trace(recorder: MutationTraceRecorder) -> Self {
        let mut session = Self::new();
        session.trace = Some(recorder);
        session
    }

    /// Action ids are allocated by the session so local tools and admitted
    /// remote batches can never collide.
    pub fn allocate_action_id(&mut self) -> ActionId {
        let id = ActionId(self.next_action_id);
        self.next_action_id = self
            .next_action_id
            .checked_add(1)
            .unwrap_or_else(|| panic!("action id space exhausted"));
        id
    }

    /// Admit a completed tool gesture into the log. Control variants are
    /// routed through `undo`/`redo` so their bookkeeping stays in one
    /// place. Invalid actions leave the log untouched.
    pub fn append_action(&mut self, action: Action) -> Result<(), ActionValidationError> {
        match action {
            Action::Undo => {
                self.undo();
                return Ok(());
            }
            Action::Redo => {
                self.redo();
                return Ok(());
            }
            _ => {}
        }
        history::validate(&action)?;
        let broadcast = !matches!(action, Action::RealtimeIngest(_));
        let pixels = action.effective_pixels();
        let action_id = action.id().expect("paint action has an id");

        self.redo_targets.clear();
        self.log.append(action);
        self.record(MutationKind::Append {
            action_id: action_id.0,
            pixel_count: pixels.len(),
        });
        self.recompute();
        if broadcast {
            self.outbound.push(OutboundWrite::from_pixels(&pixels));
        }
        Ok(())
    }

    /// Undo the most recent local paint. The Undo marker is appended even
    /// on underflow (bookkeeping symmetry); on success the restored pixels
    /// are queued as an ordinary outbound write, so on the wire an undo is
    /// indistinguishable from a paint.
    pub fn undo(&mut self) -> Option<ActionId> {
        let target = self.last_undoable_target();
        let restored = target
            .as_ref()
            .map(|target| self.restored_pixels(target.id, &target.points));

        self.log.append(Action::Undo);
        self.record(MutationKind::Undo {
            target_action_id: target.as_ref().map(|target| target.id.0),
        });
        self.recompute();

        let target = target?;
        self.redo_targets.push(target.id);
        let restored = restored.unwrap_or_default();
        if !restored.is_empty() {
            self.outbound.push(OutboundWrite::from_pixels(&restored));
        }
        Some(target.id)
    }

    /// Redo the most recently undone paint by replaying its own pixels
    /// verbatim. No-op (but still logged) when nothing is undone.
    pub fn redo(&mut self) -> Option<ActionId> {
        let target_id = self.redo_targets.pop();
        let replayed = target_id.and_then(|id| {
            self.log
                .find(id)
                .map(|action| action.effective_pixels())
        });

        self.log.append(Action::Redo);
        self.record(MutationKind::Redo {
            target_action_id: target_id.map(|id| id.0),
        });
        self.recompute();

        let pixels = replayed?;
        if !pixels.is_empty() {
            self.outbound.push(OutboundWrite::from_pixels(&pixels));
        }
        target_id
    }

    /// Admit pixels painted by other sessions. Batches are split into
    /// same-color runs (one `RealtimeIngest` action each, preserving
    /// arrival order) and are never a local undo target. Nothing is
    /// broadcast back.
    pub fn ingest_remote(
        &mut self,
        batch: &RemotePixelBatch,
    ) -> Result<usize, ActionValidationError> {
        let mut pixels = Vec::with_capacity(batch.pixels.len());
        for wire in &batch.pixels {
            let color = PaletteRef::new(wire.color)
                .ok_or(ActionValidationError::InvalidColorReference { raw: wire.color })?;
            pixels.push(Pixel::new(wire.x, wire.y, color));
        }
        if pixels.is_empty() {
            return Ok(0);
        }

        let mut runs: Vec<(PaletteRef, Vec<Point>)> = Vec::new();
        for pixel in &pixels {
            match runs.last_mut() {
                Some((color, points)) if *color == pixel.color => {
                    points.push(pixel.point());
                }
                _ => runs.push((pixel.color, vec![pixel.point()])),
            }
        }

        let run_count = runs.len();
        self.redo_targets.clear();
        for (color, points) in runs {
            let id = self.allocate_action_id();
            self.log
                .append(Action::RealtimeIngest(PaintAction::new(id, color, points)));
        }
        self.record(MutationKind::Ingest {
            action_count: run_count,
            pixel_count: pixels.len(),
        });
        self.recompute();
        Ok(run_count)
    }

    pub fn ensure_chunk(&mut self, key: ChunkKey) -> EnsureOutcome {
        self.chunks.ensure(key)
    }

    /// Chunk fetch requests accumulated since the last drain, for the
    /// network collaborator to dispatch.
    pub fn drain_fetch_requests(&mut self) -> Vec<ChunkFetchRequest> {
        self.chunks
            .drain_fetch_requests()
            .into_iter()
            .map(ChunkFetchRequest::from_key)
            .collect()
    }

    pub fn on_chunk_fetch_resolved(&mut self, key: ChunkKey, pixels: &[Pixel]) {
        self.chunks.on_fetch_resolved(key, pixels);
        self.recompute();
    }

    pub fn on_chunk_fetch_failed(&mut self, key: ChunkKey) {
        self.chunks.on_fetch_failed(key);
    }

    pub fn evict_chunk(&mut self, key: ChunkKey) {
        self.chunks.evict(key);
    }

    pub fn chunk_state(&self, key: ChunkKey) -> Option<ChunkFetchState> {
        self.chunks.chunk_state(key)
    }

    /// Committed color beneath any in-flight local edits, for
    /// flood-fill/eyedropper collaborators.
    pub fn get_pixel_value(&self, x: i32, y: i32) -> Option<PaletteRef> {
        self.chunks.get_pixel_value(x, y)
    }

    /// The resolved log's pixels, deduplicated last-wins per coordinate.
    /// Read by the renderer once per frame; pure beyond its own output.
    pub fn derive_visible_pixels(&self) -> Vec<Pixel> {
        history::derive_visible_pixels(self.log.entries())
    }

    /// Pixels currently falling back to the chunk base because their
    /// action is undone.
    pub fn derive_unset_pixels(&self) -> Vec<Pixel> {
        history::derive_unset_pixels(self.log.entries())
    }

    pub fn drain_outbound_writes(&mut self) -> Vec<OutboundWrite> {
        std::mem::take(&mut self.outbound)
    }

    /// Server-durability hook: merge acknowledged pixels into their chunk
    /// base bitmaps so later undo fallbacks can restore them locally.
    pub fn apply_committed(&mut self, pixels: &[Pixel]) {
        self.chunks.write_back(pixels);
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    pub fn revision(&self) -> u64 {
        self.log.revision()
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    /// Last locally undoable entry of the resolved view, captured as owned
    /// data so the undo path can mutate the log afterwards.
    fn last_undoable_target(&self) -> Option<UndoTarget> {
        let resolved = self.log.resolved();
        let entry = resolved
            .iter()
            .rev()
            .find(|entry| entry.is_locally_undoable())?;
        let paint = entry.paint().expect("undoable entry is a paint action");
        Some(UndoTarget {
            id: paint.id,
            points: dedup_last_wins(paint.points.clone()),
        })
    }

    /// Three-tier fallback for each coordinate the undone action touched:
    /// (a) the value visible had the action never happened, (b) the
    /// committed chunk base value, (c) transparent.
    fn restored_pixels(&self, target: ActionId, points: &[Point]) -> Vec<Pixel> {
        let resolved = self.log.resolved();
        let without_target: Vec<&Action> = resolved
            .into_iter()
            .filter(|entry| entry.id() != Some(target))
            .collect();
        let prior: HashMap<(i32, i32), PaletteRef> =
            dedup_last_wins(history::derive_pixels(&without_target))
                .into_iter()
                .map(|pixel| (pixel.dedup_key(), pixel.color))
                .collect();

        points
            .iter()
            .map(|point| {
                let color = prior
                    .get(&(point.x, point.y))
                    .copied()
                    .or_else(|| self.chunks.get_pixel_value(point.x, point.y))
                    .unwrap_or(PaletteRef::TRANSPARENT);
                Pixel::new(point.x, point.y, color)
            })
            .collect()
    }

    /// One synchronous recompute pass after every log mutation. Idempotent:
    /// it may run many times per second during continuous pointer movement.
    fn recompute(&mut self) {
        let unset = history::derive_unset_pixels(self.log.entries());
        let visible = history::derive_visible_pixels(self.log.entries());
        self.chunks.unset(&unset);
        self.chunks.mark_overlay(&visible);
    }

    fn record(&mut self, kind: MutationKind) {
        let revision = self.log.revision();
        if let Some(trace) = self.trace.as_mut() {
            trace.record(revision, kind);
        }
    }
}

struct UndoTarget {
    id: ActionId,
    points: Vec<Point>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::WirePixel;

    fn color(index: u8) -> PaletteRef {
        PaletteRef::new(index).expect("valid palette index")
    }

    fn points(coordinates: &[(i32, i32)]) -> Vec<Point> {
        coordinates
            .iter()
            .map(|&(x, y)| Point::new(x, y))
            .collect()
    }

    fn paint(session: &mut CanvasSession, color_index: u8, coordinates: &[(i32, i32)]) -> ActionId {
        let id = session.allocate_action_id();
        session
            .append_action(Action::Brush(PaintAction::new(
                id,
                color(color_index),
                points(coordinates),
            )))
            .expect("append brush action");
        id
    }

    fn resolved_ids(session: &CanvasSession) -> Vec<u64> {
        session
            .log()
            .resolved()
            .iter()
            .filter_map(|entry| entry.id())
            .map(|id| id.0)
            .collect()
    }

    fn outbound_pixels(write: &OutboundWrite) -> Vec<(i32, i32, u8)> {
        write
            .pixels
            .iter()
            .map(|pixel| (pixel.x, pixel.y, pixel.color))
            .collect()
    }

    #[test]
    fn append_rejects_malformed_actions_and_leaves_the_log_unchanged() {
        let mut session = CanvasSession::new();
        let id = session.allocate_action_id();
        let result = session.append_action(Action::Brush(PaintAction::new(
            id,
            color(1),
            Vec::new(),
        )));
        assert_eq!(result, Err(ActionValidationError::EmptyPointList));
        assert_eq!(session.revision(), 0);
        assert!(session.drain_outbound_writes().is_empty());
    }

    #[test]
    fn paint_appends_broadcast_and_become_visible() {
        let mut session = CanvasSession::new();
        paint(&mut session, 3, &[(1, 1), (2, 2)]);
        assert_eq!(
            session.derive_visible_pixels(),
            vec![Pixel::new(1, 1, color(3)), Pixel::new(2, 2, color(3))]
        );
        let writes = session.drain_outbound_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(outbound_pixels(&writes[0]), vec![(1, 1, 3), (2, 2, 3)]);
    }

    #[test]
    fn undo_underflow_is_logged_but_emits_nothing() {
        let mut session = CanvasSession::new();
        assert_eq!(session.undo(), None);
        assert_eq!(session.revision(), 1);
        assert!(session.drain_outbound_writes().is_empty());
        assert_eq!(session.redo(), None);
        assert_eq!(session.revision(), 2);
    }

    #[test]
    fn undo_restores_the_prior_log_value_first() {
        let mut session = CanvasSession::new();
        paint(&mut session, 1, &[(1, 1)]);
        let second = paint(&mut session, 2, &[(1, 1)]);
        session.drain_outbound_writes();

        assert_eq!(session.undo(), Some(second));
        assert_eq!(session.derive_visible_pixels(), vec![Pixel::new(1, 1, color(1))]);
        let writes = session.drain_outbound_writes();
        assert_eq!(writes.len(), 1);
        // Tier (a): the value had the undone action never happened.
        assert_eq!(outbound_pixels(&writes[0]), vec![(1, 1, 1)]);
    }

    #[test]
    fn undo_falls_back_to_the_chunk_base_then_transparent() {
        let mut session = CanvasSession::new();
        let key = ChunkKey::containing(0, 0);
        session.ensure_chunk(key);
        session.drain_fetch_requests();
        // (1,1) was committed before this session; (2,2) never was.
        session.on_chunk_fetch_resolved(key, &[Pixel::new(1, 1, color(5))]);

        let id = paint(&mut session, 2, &[(1, 1), (2, 2)]);
        session.drain_outbound_writes();

        assert_eq!(session.undo(), Some(id));
        let writes = session.drain_outbound_writes();
        assert_eq!(writes.len(), 1);
        // Tier (b) for the committed pixel, tier (c) for the fresh one.
        assert_eq!(outbound_pixels(&writes[0]), vec![(1, 1, 5), (2, 2, 0)]);
    }

    #[test]
    fn redo_replays_the_undone_action_verbatim() {
        let mut session = CanvasSession::new();
        paint(&mut session, 1, &[(1, 1), (2, 2), (3, 3)]);
        let second = paint(&mut session, 1, &[(1, 1), (2, 2), (3, 3)]);
        session.drain_outbound_writes();

        assert_eq!(session.undo(), Some(second));
        session.drain_outbound_writes();
        assert_eq!(session.redo(), Some(second));
        assert_eq!(resolved_ids(&session), vec![1, 2]);
        assert!(session.derive_unset_pixels().is_empty());

        let writes = session.drain_outbound_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(
            outbound_pixels(&writes[0]),
            vec![(1, 1, 1), (2, 2, 1), (3, 3, 1)]
        );
    }

    #[test]
    fn a_new_edit_discards_the_redo_target_stack() {
        let mut session = CanvasSession::new();
        paint(&mut session, 1, &[(0, 0)]);
        session.undo();
        paint(&mut session, 2, &[(5, 5)]);
        assert_eq!(session.redo(), None);
        assert_eq!(resolved_ids(&session), vec![2]);
    }

    #[test]
    fn redo_target_stack_agrees_with_the_fold() {
        let mut session = CanvasSession::new();
        paint(&mut session, 1, &[(0, 0)]);
        paint(&mut session, 2, &[(1, 0)]);
        paint(&mut session, 3, &[(2, 0)]);
        session.undo();
        session.undo();
        assert_eq!(resolved_ids(&session), vec![1]);
        session.redo();
        assert_eq!(resolved_ids(&session), vec![1, 2]);
        session.redo();
        assert_eq!(resolved_ids(&session), vec![1, 2, 3]);
        // Exhausted: a further redo is an underflow no-op.
        assert_eq!(session.redo(), None);
        assert_eq!(resolved_ids(&session), vec![1, 2, 3]);
    }

    #[test]
    fn ingested_remote_pixels_are_not_locally_undoable() {
        let mut session = CanvasSession::new();
        let local = paint(&mut session, 1, &[(0, 0)]);
        let batch = RemotePixelBatch {
            pixels: vec![WirePixel {
                x: 8,
                y: 8,
                color: 6,
            }],
        };
        assert_eq!(session.ingest_remote(&batch), Ok(1));
        session.drain_outbound_writes();

        // Undo skips the remote paint and rolls back the local one.
        assert_eq!(session.undo(), Some(local));
        let visible = session.derive_visible_pixels();
        assert_eq!(visible, vec![Pixel::new(8, 8, color(6))]);
        // Nothing was broadcast back for the ingest itself.
        let writes = session.drain_outbound_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(outbound_pixels(&writes[0]), vec![(0, 0, 0)]);
    }

    #[test]
    fn ingest_splits_batches_into_same_color_runs() {
        let mut session = CanvasSession::new();
        let batch = RemotePixelBatch {
            pixels: vec![
                WirePixel { x: 0, y: 0, color: 1 },
                WirePixel { x: 1, y: 0, color: 1 },
                WirePixel { x: 2, y: 0, color: 2 },
                WirePixel { x: 3, y: 0, color: 1 },
            ],
        };
        assert_eq!(session.ingest_remote(&batch), Ok(3));
        assert_eq!(session.revision(), 3);
        assert_eq!(
            session.derive_visible_pixels(),
            vec![
                Pixel::new(0, 0, color(1)),
                Pixel::new(1, 0, color(1)),
                Pixel::new(2, 0, color(2)),
                Pixel::new(3, 0, color(1)),
            ]
        );
    }

    #[test]
    fn ingest_rejects_invalid_color_references() {
        let mut session = CanvasSession::new();
        let batch = RemotePixelBatch {
            pixels: vec![WirePixel {
                x: 0,
                y: 0,
                color: 0xFF,
            }],
        };
        assert_eq!(
            session.ingest_remote(&batch),
            Err(ActionValidationError::InvalidColorReference { raw: 0xFF })
        );
        assert_eq!(session.revision(), 0);
    }

    #[test]
    fn an_empty_remote_batch_is_a_no_op() {
        let mut session = CanvasSession::new();
        let batch = RemotePixelBatch { pixels: Vec::new() };
        assert_eq!(session.ingest_remote(&batch), Ok(0));
        assert_eq!(session.revision(), 0);
    }

    #[test]
    fn remote_ingest_discards_pending_redo_history() {
        let mut session = CanvasSession::new();
        paint(&mut session, 1, &[(0, 0)]);
        session.undo();
        let batch = RemotePixelBatch {
            pixels: vec![WirePixel { x: 9, y: 9, color: 2 }],
        };
        session.ingest_remote(&batch).expect("ingest batch");
        assert_eq!(session.redo(), None);
        assert_eq!(resolved_ids(&session).len(), 1);
    }

    #[test]
    fn undo_clears_the_overlay_so_the_base_shows_through() {
        let mut session = CanvasSession::new();
        let key = ChunkKey::containing(0, 0);
        session.ensure_chunk(key);
        session.on_chunk_fetch_resolved(key, &[Pixel::new(1, 1, color(5))]);

        paint(&mut session, 2, &[(1, 1)]);
        assert!(session.chunks().overlay_is_set(1, 1));

        session.undo();
        assert!(!session.chunks().overlay_is_set(1, 1));
        assert_eq!(session.get_pixel_value(1, 1), Some(color(5)));
    }

    #[test]
    fn fetch_requests_flow_out_once_per_origin() {
        let mut session = CanvasSession::new();
        let key = ChunkKey::containing(100, -100);
        assert_eq!(session.ensure_chunk(key), EnsureOutcome::Requested);
        assert_eq!(session.ensure_chunk(key), EnsureOutcome::AlreadyPending);
        let requests = session.drain_fetch_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].key(), key);
        assert!(session.drain_fetch_requests().is_empty());
    }

    #[test]
    fn failed_fetch_surfaces_as_an_empty_chunk() {
        let mut session = CanvasSession::new();
        let key = ChunkKey::containing(0, 0);
        session.ensure_chunk(key);
        session.on_chunk_fetch_failed(key);
        assert_eq!(session.chunk_state(key), Some(ChunkFetchState::Failed));
        assert_eq!(session.get_pixel_value(0, 0), None);
    }

    #[test]
    fn late_fetch_result_after_eviction_is_discarded() {
        let mut session = CanvasSession::new();
        let key = ChunkKey::containing(0, 0);
        session.ensure_chunk(key);
        session.evict_chunk(key);
        session.on_chunk_fetch_resolved(key, &[Pixel::new(1, 1, color(4))]);
        assert_eq!(session.chunk_state(key), None);
        assert_eq!(session.get_pixel_value(1, 1), None);
    }

    #[test]
    fn committed_writes_back_into_the_base_enable_local_restore() {
        let mut session = CanvasSession::new();
        let key = ChunkKey::containing(0, 0);
        session.ensure_chunk(key);
        session.on_chunk_fetch_resolved(key, &[]);

        // The server acknowledges an earlier paint as durable.
        session.apply_committed(&[Pixel::new(4, 4, color(8))]);

        let id = paint(&mut session, 2, &[(4, 4)]);
        session.drain_outbound_writes();
        assert_eq!(session.undo(), Some(id));
        let writes = session.drain_outbound_writes();
        assert_eq!(outbound_pixels(&writes[0]), vec![(4, 4, 8)]);
    }

    #[test]
    fn recompute_is_idempotent_across_repeated_frames() {
        let mut session = CanvasSession::new();
        let key = ChunkKey::containing(0, 0);
        session.ensure_chunk(key);
        session.on_chunk_fetch_resolved(key, &[Pixel::new(0, 0, color(9))]);
        paint(&mut session, 1, &[(0, 0), (1, 1)]);
        session.undo();

        let visible = session.derive_visible_pixels();
        let unset = session.derive_unset_pixels();
        for _ in 0..3 {
            assert_eq!(session.derive_visible_pixels(), visible);
            assert_eq!(session.derive_unset_pixels(), unset);
        }
    }
}
