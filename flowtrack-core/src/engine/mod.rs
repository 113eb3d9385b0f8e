//! engine — per-frame tracking state machine
//!
//! One call to [`TrackingEngine::process_frame`] runs a whole frame:
//! velocity-field ingestion, detection gating, prediction for every live
//! entity, detection-to-track association, merge/split resolution,
//! occlusion bookkeeping, and pruning.  Frames are strictly sequential;
//! every association decision in a frame is made against the same
//! snapshot of predicted positions.
//!
//! Per-entity lifecycle: Active → Predicted → Matched (back to Active),
//! Occluded (aged up to a grace period inside permitted hidden zones),
//! or Lost (removed).

use tracing::{debug, error};

use crate::entity::{BBox, EntityArena, EntityHandle, TrackGroup, TrackedEntity};
use crate::field::{FlowSample, VelocityField};
use crate::mask::HiddenMask;
use crate::predict::FusionTopology;

// ── Configuration ────────────────────────────────────────────────────────────

/// Engine tuning knobs.  The defaults are the values the tracker was
/// calibrated with.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Detections with a box area not greater than this are discarded as
    /// segmentation noise.
    pub min_detection_area: f32,
    /// Consecutive hidden frames an occluded entity survives.
    pub hidden_grace_frames: u32,
    /// Mask values strictly above this mark a permitted hidden zone.
    pub hidden_mask_threshold: u8,
    /// Predictor topology given to every new entity.
    pub topology: FusionTopology,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_detection_area: 800.0,
            hidden_grace_frames: 60,
            hidden_mask_threshold: 200,
            topology: FusionTopology::DoubleKalmanSingleField,
        }
    }
}

// ── Tracks ───────────────────────────────────────────────────────────────────

/// One record in the engine's working set: a single entity or a merged
/// cluster.
pub enum Track {
    Single(EntityHandle),
    Group(TrackGroup),
}

impl Track {
    /// Member handles of a group track.  Asking a single track for its
    /// members is a caller contract violation and reports a typed error.
    pub fn members(&self) -> Result<&[EntityHandle], TrackError> {
        match self {
            Track::Group(group) => Ok(&group.members),
            Track::Single(_) => Err(TrackError::NotAGroup),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrackError {
    #[error("track does not hold a group")]
    NotAGroup,
}

/// Renderer-facing snapshot of one single entity.
pub struct TrackView<'a> {
    /// Display label; hidden entities carry an `h` suffix.
    pub label: String,
    pub bbox: BBox,
    pub hidden: bool,
    /// Ordered polyline of corrected centers.
    pub track: &'a [nalgebra::Vector2<f32>],
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Owns the entity arena, the working set of tracks, and the injected
/// velocity field.
pub struct TrackingEngine {
    config: EngineConfig,
    field: VelocityField,
    arena: EntityArena,
    tracks: Vec<Track>,
    frames: u64,
}

impl TrackingEngine {
    pub fn new(field: VelocityField, config: EngineConfig) -> Self {
        Self {
            config,
            field,
            arena: EntityArena::new(),
            tracks: Vec::new(),
            frames: 0,
        }
    }

    pub fn field(&self) -> &VelocityField {
        &self.field
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn entity(&self, handle: EntityHandle) -> Option<&TrackedEntity> {
        self.arena.get(handle)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    /// Run one frame end-to-end.
    ///
    /// `detections` are candidate boxes from the current foreground mask,
    /// `flows` the sparse correspondences against the previous frame, and
    /// `mask` the permitted-hidden-zone image.
    pub fn process_frame(
        &mut self,
        detections: &[BBox],
        flows: &[FlowSample],
        mask: &HiddenMask,
    ) {
        self.frames += 1;

        // The field absorbs this frame's motion evidence first; it is
        // read-only for the rest of the frame.
        self.field.ingest(flows);

        let accepted: Vec<BBox> = detections
            .iter()
            .copied()
            .filter(|d| d.area() > self.config.min_detection_area)
            .collect();
        if accepted.len() != detections.len() {
            debug!(
                dropped = detections.len() - accepted.len(),
                "small detections discarded"
            );
        }

        self.predict_all();
        self.associate(accepted, mask);
    }

    /// Advance every single entity and every group member one frame.
    fn predict_all(&mut self) {
        for track in &self.tracks {
            match track {
                Track::Single(handle) => {
                    if let Some(entity) = self.arena.get_mut(*handle) {
                        entity.predict_position(&self.field);
                    } else {
                        error!(?handle, "stale single-track handle at predict");
                    }
                }
                Track::Group(group) => {
                    for &handle in &group.members {
                        if let Some(entity) = self.arena.get_mut(handle) {
                            entity.predict_position(&self.field);
                        } else {
                            error!(?handle, "stale group-member handle at predict");
                        }
                    }
                }
            }
        }
    }

    /// Match detections against predicted centers, then age or drop
    /// whatever stayed unclaimed.
    fn associate(&mut self, detections: Vec<BBox>, mask: &HiddenMask) {
        let mut working: Vec<Option<Track>> = std::mem::take(&mut self.tracks)
            .into_iter()
            .map(Some)
            .collect();
        let mut next: Vec<Track> = Vec::new();

        for detection in &detections {
            let mut matched: Vec<EntityHandle> = Vec::new();

            // Claim every tracked entity whose predicted center falls
            // strictly inside this detection.  Groups are expanded; a
            // claimed member leaves its group for good.
            for slot in working.iter_mut() {
                let Some(track) = slot else { continue };
                match track {
                    Track::Single(handle) => {
                        let handle = *handle;
                        match self.arena.get(handle) {
                            Some(entity) if detection.contains(entity.predicted_center()) => {
                                matched.push(handle);
                                *slot = None;
                            }
                            Some(_) => {}
                            None => {
                                error!(?handle, "stale single-track handle at association");
                                *slot = None;
                            }
                        }
                    }
                    Track::Group(group) => {
                        let arena = &self.arena;
                        group.members.retain(|&handle| match arena.get(handle) {
                            Some(entity) if detection.contains(entity.predicted_center()) => {
                                matched.push(handle);
                                false
                            }
                            Some(_) => true,
                            None => {
                                error!(?handle, "stale group-member handle at association");
                                false
                            }
                        });
                    }
                }
            }

            self.resolve_detection(*detection, matched, &mut next);
        }

        self.prune_unclaimed(working, mask, &mut next);
        self.tracks = next;
    }

    /// Apply the association outcome for one detection.
    fn resolve_detection(
        &mut self,
        detection: BBox,
        matched: Vec<EntityHandle>,
        next: &mut Vec<Track>,
    ) {
        match matched.len() {
            // A detection nobody claimed starts a fresh track.
            0 => {
                let entity = TrackedEntity::new(detection, self.config.topology);
                debug!(label = entity.label(), "new track");
                next.push(Track::Single(self.arena.insert(entity)));
            }

            // A single claimant takes over the detection's geometry and is
            // re-anchored on the freshly observed center.
            1 => {
                let handle = matched[0];
                let Some(entity) = self.arena.get_mut(handle) else {
                    error!(?handle, "matched handle vanished before update");
                    return;
                };
                if entity.is_hidden() {
                    entity.mark_visible();
                }
                entity.absorb_geometry(&detection);
                let center = entity.center();
                entity.correct_position(center);
                next.push(Track::Single(handle));
            }

            count => {
                let hidden_first = self
                    .arena
                    .get(matched[0])
                    .is_some_and(TrackedEntity::is_hidden);
                let hidden_second = self
                    .arena
                    .get(matched[1])
                    .is_some_and(TrackedEntity::is_hidden);

                if count == 2 && (hidden_first || hidden_second) {
                    // Reappearance: the detector re-found an occluded object
                    // next to a spurious second detection of a visible one.
                    // Keep the returning entity, discard the other.
                    let keep = if hidden_second { 1 } else { 0 };
                    self.arena.remove(matched[1 - keep]);
                    let handle = matched[keep];
                    let Some(entity) = self.arena.get_mut(handle) else {
                        error!(?handle, "reappearing handle vanished before update");
                        return;
                    };
                    entity.mark_visible();
                    entity.absorb_geometry(&detection);
                    let center = entity.center();
                    entity.correct_position(center);
                    debug!(label = entity.label(), "occluded track reappeared");
                    next.push(Track::Single(handle));
                } else {
                    // Undisambiguable overlap: fold every claimant into one
                    // merged cluster carrying the detection's geometry.
                    for &handle in &matched {
                        if let Some(entity) = self.arena.get_mut(handle) {
                            entity.no_correction();
                        }
                    }
                    let mut group = TrackGroup::new(detection, matched);
                    group.compose_label(&self.arena);
                    debug!(
                        label = group.label(),
                        members = group.members.len(),
                        "tracks merged"
                    );
                    next.push(Track::Group(group));
                }
            }
        }
    }

    /// Unclaimed singles age inside permitted hidden zones and are lost
    /// elsewhere; unclaimed groups are dropped as a unit.
    fn prune_unclaimed(
        &mut self,
        working: Vec<Option<Track>>,
        mask: &HiddenMask,
        next: &mut Vec<Track>,
    ) {
        for slot in working {
            let Some(track) = slot else { continue };
            match track {
                Track::Single(handle) => {
                    let Some(entity) = self.arena.get_mut(handle) else {
                        error!(?handle, "stale single-track handle at pruning");
                        continue;
                    };
                    let center = entity.predicted_center();
                    if mask.sample(center.x, center.y) > self.config.hidden_mask_threshold {
                        entity.no_correction();
                        if !entity.is_hidden() {
                            entity.mark_hidden();
                        }
                        if entity.hidden_frames() < self.config.hidden_grace_frames {
                            next.push(Track::Single(handle));
                        } else {
                            debug!(
                                label = entity.label(),
                                frames = entity.hidden_frames(),
                                "occlusion grace expired"
                            );
                            self.arena.remove(handle);
                        }
                    } else {
                        debug!(label = entity.label(), "track lost");
                        self.arena.remove(handle);
                    }
                }
                Track::Group(group) => {
                    debug!(label = group.label(), "unmatched group dropped");
                    for handle in group.members {
                        self.arena.remove(handle);
                    }
                }
            }
        }
    }

    /// Renderer contract: one view per single entity, groups flattened to
    /// their members.
    pub fn views(&self) -> Vec<TrackView<'_>> {
        let mut views = Vec::new();
        for track in &self.tracks {
            match track {
                Track::Single(handle) => self.push_view(*handle, &mut views),
                Track::Group(group) => {
                    for &handle in &group.members {
                        self.push_view(handle, &mut views);
                    }
                }
            }
        }
        views
    }

    fn push_view<'a>(&'a self, handle: EntityHandle, views: &mut Vec<TrackView<'a>>) {
        let Some(entity) = self.arena.get(handle) else {
            error!(?handle, "stale handle while building views");
            return;
        };
        let label = if entity.is_hidden() {
            format!("{}h", entity.label())
        } else {
            entity.label().to_owned()
        };
        views.push(TrackView {
            label,
            bbox: entity.bbox(),
            hidden: entity.is_hidden(),
            track: entity.track(),
        });
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
