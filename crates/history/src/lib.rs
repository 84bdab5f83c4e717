use std::collections::HashSet;
use std::fmt;

use model::{ChunkKey, PaletteRef, Pixel, Point, touched_chunk_keys};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId(pub u64);

/// Payload shared by every paint-type action: one palette reference and the
/// absolute coordinates the gesture touched. Touched chunk keys are
/// precomputed at construction so cache invalidation never rescans points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaintAction {
    pub id: ActionId,
    pub color: PaletteRef,
    pub points: Vec<Point>,
    pub touched_chunks: SmallVec<[ChunkKey; 4]>,
}

impl PaintAction {
    pub fn new(id: ActionId, color: PaletteRef, points: Vec<Point>) -> Self {
        let touched_chunks = touched_chunk_keys(&points).into_iter().collect();
        Self {
            id,
            color,
            points,
            touched_chunks,
        }
    }
}

/// One recorded edit operation. Adding a tool adds one paint variant here
/// and nothing in the resolver or derivers changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Brush(PaintAction),
    Erase(PaintAction),
    Bucket(PaintAction),
    Line(PaintAction),
    Rectangle(PaintAction),
    Ellipse(PaintAction),
    Claim(PaintAction),
    RealtimeIngest(PaintAction),
    Undo,
    Redo,
}

impl Action {
    pub fn paint(&self) -> Option<&PaintAction> {
        match self {
            Action::Brush(paint)
            | Action::Erase(paint)
            | Action::Bucket(paint)
            | Action::Line(paint)
            | Action::Rectangle(paint)
            | Action::Ellipse(paint)
            | Action::Claim(paint)
            | Action::RealtimeIngest(paint) => Some(paint),
            Action::Undo | Action::Redo => None,
        }
    }

    pub fn id(&self) -> Option<ActionId> {
        self.paint().map(|paint| paint.id)
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Action::Undo | Action::Redo)
    }

    /// Remote paints stay in the resolved view but are never a local undo
    /// target: a local Undo must not roll back another user's edit.
    pub fn is_locally_undoable(&self) -> bool {
        match self {
            Action::RealtimeIngest(_) | Action::Undo | Action::Redo => false,
            _ => self.paint().is_some(),
        }
    }

    /// Color the action actually puts on the canvas. Erasure always derives
    /// the transparent sentinel regardless of its carried reference.
    pub fn effective_color(&self) -> Option<PaletteRef> {
        match self {
            Action::Erase(_) => Some(PaletteRef::TRANSPARENT),
            other => other.paint().map(|paint| paint.color),
        }
    }

    pub fn effective_pixels(&self) -> Vec<Pixel> {
        let Some(paint) = self.paint() else {
            return Vec::new();
        };
        let color = self
            .effective_color()
            .expect("paint action has an effective color");
        paint
            .points
            .iter()
            .map(|point| Pixel::new(point.x, point.y, color))
            .collect()
    }

    fn coordinate_set(&self) -> HashSet<(i32, i32)> {
        self.paint()
            .map(|paint| {
                paint
                    .points
                    .iter()
                    .map(|point| (point.x, point.y))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionValidationError {
    EmptyPointList,
    InvalidColorReference { raw: u8 },
    MissingChunkCoverage,
}

impl fmt::Display for ActionValidationError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionValidationError::EmptyPointList => {
                write!(formatter, "paint action carries an empty point list")
            }
            ActionValidationError::InvalidColorReference { raw } => {
                write!(formatter, "invalid palette color reference {raw:#04x}")
            }
            ActionValidationError::MissingChunkCoverage => {
                write!(
                    formatter,
                    "paint action chunk key set does not cover its points"
                )
            }
        }
    }
}

impl std::error::Error for ActionValidationError {}

/// Boundary check run before an action may enter the log.
pub fn validate(action: &Action) -> Result<(), ActionValidationError> {
    let Some(paint) = action.paint() else {
        return Ok(());
    };
    if paint.points.is_empty() {
        return Err(ActionValidationError::EmptyPointList);
    }
    let covered: HashSet<ChunkKey> = paint.touched_chunks.iter().copied().collect();
    for point in &paint.points {
        if !covered.contains(&point.chunk_key()) {
            return Err(ActionValidationError::MissingChunkCoverage);
        }
    }
    Ok(())
}

/// Append-only sequence of local edits and admitted remote edits, in
/// arrival order. Append is the only mutation.
#[derive(Debug, Default)]
pub struct ActionLog {
    entries: Vec<Action>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn append(&mut self, action: Action) {
        self.entries.push(action);
    }

    pub fn entries(&self) -> &[Action] {
        &self.entries
    }

    pub fn revision(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn find(&self, id: ActionId) -> Option<&Action> {
        self.entries.iter().find(|entry| entry.id() == Some(id))
    }

    pub fn resolved(&self) -> Vec<&Action> {
        resolve(&self.entries)
    }
}

/// Collapse Undo/Redo markers into the effective ordered action sequence.
///
/// Left fold with a `completed` list and an `undone` stack:
/// - `Undo` moves the most recent locally-undoable completed entry onto the
///   undone stack (no-op when there is none);
/// - `Redo` moves the top of the undone stack back (no-op when empty);
/// - any paint entry clears the undone stack and appends to `completed`.
///
/// Pure and total: resolving twice over an unchanged log is identical, and
/// `k` Redo after `k` Undo restores the pre-undo view. A redone entry
/// rejoins at the end of `completed`, so when remote ingests interleave
/// with the undone span it counts as the newest edit from then on.
pub fn resolve(entries: &[Action]) -> Vec<&Action> {
    let mut completed: Vec<&Action> = Vec::new();
    let mut undone: Vec<&Action> = Vec::new();
    for action in entries {
        match action {
            Action::Undo => {
                if let Some(position) = completed
                    .iter()
                    .rposition(|entry| entry.is_locally_undoable())
                {
                    undone.push(completed.remove(position));
                }
            }
            Action::Redo => {
                if let Some(entry) = undone.pop() {
                    completed.push(entry);
                }
            }
            _ => {
                undone.clear();
                completed.push(action);
            }
        }
    }
    completed
}

/// Pixels of every paint entry of a resolved view, concatenated in order.
/// The caller deduplicates; the later entry per coordinate wins.
pub fn derive_pixels(resolved: &[&Action]) -> Vec<Pixel> {
    resolved
        .iter()
        .flat_map(|entry| entry.effective_pixels())
        .collect()
}

/// Resolved, derived, and deduplicated in one step.
pub fn derive_visible_pixels(entries: &[Action]) -> Vec<Pixel> {
    model::dedup_last_wins(derive_pixels(&resolve(entries)))
}

/// Pixels that must fall back to a prior layer because their action is
/// currently undone. Replays the raw log: an Undo adds the undone action's
/// own pixels to the unset set, a Redo removes them again by coordinate,
/// and any new paint entry discards the pending redo stack for good (its
/// unset pixels stay unset forever).
pub fn derive_unset_pixels(entries: &[Action]) -> Vec<Pixel> {
    let mut completed: Vec<&Action> = Vec::new();
    let mut undone: Vec<&Action> = Vec::new();
    let mut unset: Vec<Pixel> = Vec::new();
    for action in entries {
        match action {
            Action::Undo => {
                if let Some(position) = completed
                    .iter()
                    .rposition(|entry| entry.is_locally_undoable())
                {
                    let entry = completed.remove(position);
                    unset.extend(entry.effective_pixels());
                    undone.push(entry);
                }
            }
            Action::Redo => {
                if let Some(entry) = undone.pop() {
                    let coordinates = entry.coordinate_set();
                    unset.retain(|pixel| !coordinates.contains(&(pixel.x, pixel.y)));
                    completed.push(entry);
                }
            }
            _ => {
                undone.clear();
                completed.push(action);
            }
        }
    }
    unset
}
