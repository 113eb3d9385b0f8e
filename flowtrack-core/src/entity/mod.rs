//! entity — tracked objects, merged clusters, and the arena that owns them
//!
//! A [`TrackedEntity`] is one object's life across frames: geometry frozen
//! at birth, a track of corrected centers, a hidden/visible flag, and an
//! owned predictor.  Entities live in an [`EntityArena`] and are addressed
//! everywhere else by stable [`EntityHandle`]s, so a merged cluster
//! ([`TrackGroup`]) holds handles rather than the objects themselves —
//! which also makes a group-inside-a-group unrepresentable.

use nalgebra::Vector2;
use rand::Rng;
use tracing::error;

use crate::field::{flow_angle, VelocityField};
use crate::predict::{FusionTopology, Predictor};

// ── Geometry ─────────────────────────────────────────────────────────────────

/// Axis-aligned bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> Vector2<f32> {
        Vector2::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Whether `point` lies strictly inside the box (exclusive bounds).
    pub fn contains(&self, point: Vector2<f32>) -> bool {
        self.x1 < point.x && point.x < self.x2 && self.y1 < point.y && point.y < self.y2
    }
}

// ── Single tracked entity ────────────────────────────────────────────────────

/// One object tracked across frames.
pub struct TrackedEntity {
    label: String,
    bbox: BBox,
    center: Vector2<f32>,
    predicted_center: Vector2<f32>,
    width: f32,
    height: f32,
    track: Vec<Vector2<f32>>,
    hidden: bool,
    hidden_frames: u32,
    predictor: Predictor,
}

impl TrackedEntity {
    /// Accept a detection as a new entity.  The display label is a random
    /// number in 0–99; collisions are tolerated, labels exist only for
    /// display.
    pub fn new(bbox: BBox, topology: FusionTopology) -> Self {
        let label = rand::thread_rng().gen_range(0..100).to_string();
        Self::with_label(bbox, topology, label)
    }

    pub fn with_label(bbox: BBox, topology: FusionTopology, label: String) -> Self {
        let center = bbox.center();
        let mut predictor = Predictor::fused(topology);
        predictor.set_initial_position(center);
        Self {
            label,
            bbox,
            center,
            predicted_center: center,
            width: bbox.width(),
            height: bbox.height(),
            track: Vec::new(),
            hidden: false,
            hidden_frames: 0,
            predictor,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    pub fn center(&self) -> Vector2<f32> {
        self.center
    }

    pub fn predicted_center(&self) -> Vector2<f32> {
        self.predicted_center
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    /// Ordered history of corrected centers.
    pub fn track(&self) -> &[Vector2<f32>] {
        &self.track
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn hidden_frames(&self) -> u32 {
        self.hidden_frames
    }

    /// Mark the entity as occluded and restart the occlusion age.
    pub fn mark_hidden(&mut self) {
        self.hidden = true;
        self.hidden_frames = 0;
    }

    pub fn mark_visible(&mut self) {
        self.hidden = false;
    }

    /// Heading of the entity's own recent motion, in degrees: last track
    /// point against the one five frames back when enough history exists,
    /// else against the previous point, else 0.
    fn heading(&self) -> f32 {
        let n = self.track.len();
        if n > 5 {
            flow_angle(
                self.track[n - 1].y - self.track[n - 5].y,
                self.track[n - 1].x - self.track[n - 5].x,
            )
        } else if n > 1 {
            flow_angle(
                self.track[n - 1].y - self.track[n - 2].y,
                self.track[n - 1].x - self.track[n - 2].x,
            )
        } else {
            0.0
        }
    }

    /// Advance the predictor one frame and cache the predicted center.
    pub fn predict_position(&mut self, field: &VelocityField) {
        let heading = self.heading();
        self.predictor.predict(field, heading);
        self.predicted_center = self.predictor.predicted_center();
    }

    /// Refine the predictor with a measured center and extend the track
    /// with the resulting corrected center.
    pub fn correct_position(&mut self, center: Vector2<f32>) {
        self.predictor.correct(center);
        self.track.push(self.predictor.corrected_center());
    }

    /// Measurement-free frame: the predicted center becomes the next track
    /// point and the box recenters around it with the frozen size.  Ages
    /// the occlusion counter when the entity is hidden.
    pub fn no_correction(&mut self) {
        self.track.push(self.predicted_center);
        self.bbox = BBox::new(
            self.predicted_center.x - self.width / 2.0,
            self.predicted_center.y - self.height / 2.0,
            self.predicted_center.x + self.width / 2.0,
            self.predicted_center.y + self.height / 2.0,
        );
        if self.hidden {
            self.hidden_frames += 1;
        }
    }

    /// Take over a matched detection's geometry wholesale.
    pub fn absorb_geometry(&mut self, detection: &BBox) {
        self.bbox = *detection;
        self.center = detection.center();
        self.width = detection.width();
        self.height = detection.height();
    }
}

// ── Merged cluster ───────────────────────────────────────────────────────────

/// Several entities whose detections could not be disambiguated this
/// frame, folded into a single track record.  Members stay in the arena;
/// the group only lists their handles.
pub struct TrackGroup {
    label: String,
    bbox: BBox,
    pub members: Vec<EntityHandle>,
}

impl TrackGroup {
    pub fn new(bbox: BBox, members: Vec<EntityHandle>) -> Self {
        Self {
            label: String::new(),
            bbox,
            members,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    /// Rebuild the composite label from member labels in member order:
    /// `"m" + id1 + "," + id2 + …`.
    pub fn compose_label(&mut self, arena: &EntityArena) {
        let mut label = String::from("m");
        let mut first = true;
        for &handle in &self.members {
            let Some(member) = arena.get(handle) else {
                error!(?handle, "stale member handle while composing group label");
                continue;
            };
            if !first {
                label.push(',');
            }
            label.push_str(member.label());
            first = false;
        }
        self.label = label;
    }
}

// ── Arena ────────────────────────────────────────────────────────────────────

/// Stable handle into the [`EntityArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle(u32);

/// Slot arena owning every live single entity.  Handles stay valid until
/// the entity is removed; removed slots are reused.
#[derive(Default)]
pub struct EntityArena {
    slots: Vec<Option<TrackedEntity>>,
    free: Vec<u32>,
}

impl EntityArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: TrackedEntity) -> EntityHandle {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(entity);
                EntityHandle(slot)
            }
            None => {
                self.slots.push(Some(entity));
                EntityHandle(self.slots.len() as u32 - 1)
            }
        }
    }

    pub fn get(&self, handle: EntityHandle) -> Option<&TrackedEntity> {
        self.slots.get(handle.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, handle: EntityHandle) -> Option<&mut TrackedEntity> {
        self.slots.get_mut(handle.0 as usize)?.as_mut()
    }

    pub fn remove(&mut self, handle: EntityHandle) -> Option<TrackedEntity> {
        let slot = self.slots.get_mut(handle.0 as usize)?;
        let entity = slot.take();
        if entity.is_some() {
            self.free.push(handle.0);
        }
        entity
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
