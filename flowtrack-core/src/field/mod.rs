//! field — adaptive spatial velocity field
//!
//! A grid of motion-average cells over the frame, bucketed into four
//! coarse directions.  Sparse point correspondences feed it once per
//! frame; predictors read it back as a motion prior for objects that
//! have no usable measurement of their own.
//!
//! Each cell keeps a recursively averaged velocity vector plus the
//! running mean square of each component, so a cell can also report
//! how spread-out the motion through it has been.

use std::fmt;
use std::fs;
use std::path::Path;

use nalgebra::Vector2;
use tracing::{debug, warn};

// ── Tuning constants ─────────────────────────────────────────────────────────

/// Number of direction buckets per cell.
const DIRECTIONS: usize = 4;
/// Extra adaptation weight applied once a cell has more than one sample,
/// biasing the running average toward newer motion.
const ADAPTATION: f32 = 0.02;

// ── Flow samples ─────────────────────────────────────────────────────────────

/// A sparse point correspondence between two consecutive frames, as handed
/// over by the optical-flow collaborator.
#[derive(Debug, Clone, Copy)]
pub struct FlowSample {
    pub from: Vector2<f32>,
    pub to: Vector2<f32>,
}

impl FlowSample {
    pub fn velocity(&self) -> Vector2<f32> {
        self.to - self.from
    }

    /// Heading of this correspondence in degrees (see [`flow_angle`]).
    pub fn angle(&self) -> f32 {
        let v = self.velocity();
        flow_angle(v.y, v.x)
    }
}

/// Heading angle in degrees for a displacement `(dx, dy)`.
///
/// `atan(dy/dx)` converted to degrees, shifted by +180 when `dx` is
/// negative; a vertical displacement maps to ±90 by the sign of `dy`.
/// The result is deliberately left un-normalised, spanning roughly
/// (-90, 270); [`direction_bucket`] is calibrated to that range.
pub fn flow_angle(dy: f32, dx: f32) -> f32 {
    if dx != 0.0 {
        let angle = (dy / dx).atan().to_degrees();
        if dx > 0.0 {
            angle
        } else {
            angle + 180.0
        }
    } else if dy > 0.0 {
        90.0
    } else {
        -90.0
    }
}

/// Map a heading angle to one of the four direction buckets.
fn direction_bucket(angle: f32) -> usize {
    if (-45.0..=45.0).contains(&angle) {
        0
    } else if angle > 45.0 && angle < 135.0 {
        1
    } else if (135.0..=225.0).contains(&angle) {
        2
    } else {
        3
    }
}

// ── Cells and the field ──────────────────────────────────────────────────────

/// One grid cell: averaged velocity, sample counter, and the running
/// mean square of each velocity component.
#[derive(Debug, Clone, Copy, Default)]
struct FieldCell {
    velocity: Vector2<f32>,
    samples: u32,
    mean_square: Vector2<f32>,
}

impl FieldCell {
    fn variance(&self) -> Vector2<f32> {
        self.mean_square - self.velocity
    }
}

/// Spatial velocity field: `DIRECTIONS × rows × cols` cells, one layer per
/// direction bucket.  Dimensions are fixed once constructed or loaded.
pub struct VelocityField {
    pitch: u32,
    rows: u32,
    cols: u32,
    cells: Vec<FieldCell>,
}

impl VelocityField {
    /// Build a zero-initialised field covering a `frame_width × frame_height`
    /// frame with square cells of side `pitch`.
    pub fn new(frame_height: u32, frame_width: u32, pitch: u32) -> Self {
        let rows = (frame_height as f32 / pitch as f32 + 0.5).floor() as u32;
        let cols = (frame_width as f32 / pitch as f32 + 0.5).floor() as u32;
        Self {
            pitch,
            rows,
            cols,
            cells: vec![FieldCell::default(); DIRECTIONS * (rows * cols) as usize],
        }
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    fn cell_index(&self, x: f32, y: f32, angle: f32) -> Option<usize> {
        if x < 0.0 || y < 0.0 {
            return None;
        }
        let col = (x / self.pitch as f32).floor() as u32;
        let row = (y / self.pitch as f32).floor() as u32;
        if row >= self.rows || col >= self.cols {
            return None;
        }
        let layer = direction_bucket(angle);
        Some((layer as u32 * self.rows * self.cols + row * self.cols + col) as usize)
    }

    /// Fold one velocity observation at `(x, y)` with heading `angle`
    /// (degrees) into the matching cell.
    ///
    /// The cell state advances through a first-order recursive filter
    /// `new = (A - tc)·old + (B + tc)·sample` with `A = (N-1)/N` and
    /// `B = 1/N`, applied to the velocity vector and to each squared
    /// component.
    pub fn update(&mut self, x: f32, y: f32, vx: f32, vy: f32, angle: f32) {
        let Some(index) = self.cell_index(x, y, angle) else {
            debug!(x, y, "flow sample outside the field grid");
            return;
        };
        let cell = &mut self.cells[index];
        cell.samples += 1;

        let n = cell.samples as f32;
        let a = (n - 1.0) / n;
        let b = 1.0 / n;
        let tc = if cell.samples > 1 { ADAPTATION } else { 0.0 };
        let blend = |old: f32, sample: f32| (a - tc) * old + (b + tc) * sample;

        cell.velocity.x = blend(cell.velocity.x, vx);
        cell.velocity.y = blend(cell.velocity.y, vy);
        cell.mean_square.x = blend(cell.mean_square.x, vx * vx);
        cell.mean_square.y = blend(cell.mean_square.y, vy * vy);
    }

    /// Fold a whole batch of correspondences, one cell update per sample.
    pub fn ingest(&mut self, flows: &[FlowSample]) {
        for flow in flows {
            let v = flow.velocity();
            self.update(flow.from.x, flow.from.y, v.x, v.y, flow.angle());
        }
    }

    /// Averaged velocity stored for `(x, y)` in the bucket matching `angle`.
    /// Zero when the position falls outside the grid or the cell has never
    /// been updated.
    pub fn query(&self, x: f32, y: f32, angle: f32) -> Vector2<f32> {
        match self.cell_index(x, y, angle) {
            Some(index) => self.cells[index].velocity,
            None => Vector2::zeros(),
        }
    }

    /// Per-component spread of the motion seen at `(x, y)` in the bucket
    /// matching `angle`: running mean square minus the averaged component.
    pub fn spread(&self, x: f32, y: f32, angle: f32) -> Vector2<f32> {
        match self.cell_index(x, y, angle) {
            Some(index) => self.cells[index].variance(),
            None => Vector2::zeros(),
        }
    }

    /// Number of cells that have received at least one sample.
    pub fn occupied_cells(&self) -> usize {
        self.cells.iter().filter(|c| c.samples > 0).count()
    }

    /// Number of cells carrying a non-zero averaged velocity.  Unlike
    /// [`Self::occupied_cells`] this survives a snapshot round trip, where
    /// sample counters restart at 1.
    pub fn nonzero_cells(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| c.velocity != Vector2::zeros())
            .count()
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Write the field as a flat text snapshot: a `rows;cols;pitch;` header
    /// followed by one `(re,im);` token per cell, row per line, one block per
    /// direction bucket.  Sample counters and mean squares are not persisted.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SnapshotError> {
        let mut out = String::new();
        out.push_str(&format!("{};{};{};\n", self.rows, self.cols, self.pitch));
        for layer in 0..DIRECTIONS {
            for row in 0..self.rows {
                for col in 0..self.cols {
                    let index =
                        (layer as u32 * self.rows * self.cols + row * self.cols + col) as usize;
                    let v = self.cells[index].velocity;
                    out.push_str(&format!("({},{});", v.x, v.y));
                }
                out.push('\n');
            }
            out.push('\n');
        }
        fs::write(path, out)?;
        Ok(())
    }

    /// Read a snapshot back.  The loaded field adopts the file's dimensions;
    /// every cell restarts with a sample counter of 1 and zeroed mean
    /// squares — only the averaged velocity survives a round trip.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SnapshotError> {
        let text = fs::read_to_string(path)?;
        let mut tokens = text.split(';').map(str::trim);

        let mut header = |name: &'static str| -> Result<u32, SnapshotError> {
            tokens
                .next()
                .ok_or(SnapshotError::Truncated)?
                .parse::<u32>()
                .map_err(|_| SnapshotError::Header(name))
        };
        let rows = header("rows")?;
        let cols = header("cols")?;
        let pitch = header("pitch")?;

        let mut cells = Vec::with_capacity(DIRECTIONS * (rows * cols) as usize);
        for _ in 0..DIRECTIONS * (rows * cols) as usize {
            let token = tokens.next().ok_or(SnapshotError::Truncated)?;
            let velocity = parse_complex(token)?;
            cells.push(FieldCell {
                velocity,
                samples: 1,
                mean_square: Vector2::zeros(),
            });
        }

        Ok(Self {
            pitch,
            rows,
            cols,
            cells,
        })
    }

    /// Load a snapshot, falling back to a fresh zero field of the given
    /// frame dimensions when the file is missing or unreadable.
    pub fn load_or_new<P: AsRef<Path>>(
        path: P,
        frame_height: u32,
        frame_width: u32,
        pitch: u32,
    ) -> Self {
        match Self::load(&path) {
            Ok(field) => {
                debug!(
                    rows = field.rows,
                    cols = field.cols,
                    pitch = field.pitch,
                    "velocity field restored from snapshot"
                );
                field
            }
            Err(err) => {
                warn!(
                    path = %path.as_ref().display(),
                    %err,
                    "cannot read velocity field snapshot, starting from an empty field"
                );
                Self::new(frame_height, frame_width, pitch)
            }
        }
    }
}

impl fmt::Debug for VelocityField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VelocityField")
            .field("pitch", &self.pitch)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("occupied", &self.occupied_cells())
            .finish()
    }
}

/// Parse one `(re,im)` velocity token.
fn parse_complex(token: &str) -> Result<Vector2<f32>, SnapshotError> {
    let inner = token
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| SnapshotError::Cell(token.to_owned()))?;
    let (re, im) = inner
        .split_once(',')
        .ok_or_else(|| SnapshotError::Cell(token.to_owned()))?;
    let parse = |s: &str| {
        s.trim()
            .parse::<f32>()
            .map_err(|_| SnapshotError::Cell(token.to_owned()))
    };
    Ok(Vector2::new(parse(re)?, parse(im)?))
}

/// Failures while reading or writing a velocity-field snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed snapshot header field `{0}`")]
    Header(&'static str),
    #[error("snapshot ends before all cells are read")]
    Truncated,
    #[error("malformed cell token `{0}`")]
    Cell(String),
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_partition_the_circle() {
        // Every angle in [-180, 180] lands in exactly one bucket.
        let mut degrees = -180.0f32;
        while degrees <= 180.0 {
            let bucket = direction_bucket(degrees);
            assert!(bucket < DIRECTIONS, "angle {degrees} escaped the partition");
            degrees += 0.5;
        }
        assert_eq!(direction_bucket(-45.0), 0);
        assert_eq!(direction_bucket(45.0), 0);
        assert_eq!(direction_bucket(45.1), 1);
        assert_eq!(direction_bucket(134.9), 1);
        assert_eq!(direction_bucket(135.0), 2);
        assert_eq!(direction_bucket(225.0), 2);
        assert_eq!(direction_bucket(-46.0), 3);
        assert_eq!(direction_bucket(-179.0), 3);
    }

    #[test]
    fn flow_angle_quadrants() {
        assert!((flow_angle(1.0, 1.0) - 45.0).abs() < 1e-4);
        assert!((flow_angle(-1.0, 1.0) + 45.0).abs() < 1e-4);
        // Negative dx picks up the +180 shift.
        assert!((flow_angle(1.0, -1.0) - 135.0).abs() < 1e-4);
        assert!((flow_angle(-1.0, -1.0) - 225.0).abs() < 1e-4);
        // Vertical displacements.
        assert_eq!(flow_angle(2.0, 0.0), 90.0);
        assert_eq!(flow_angle(-2.0, 0.0), -90.0);
        assert_eq!(flow_angle(0.0, 0.0), -90.0);
    }

    #[test]
    fn first_sample_is_stored_verbatim() {
        let mut field = VelocityField::new(100, 100, 10);
        field.update(15.0, 25.0, 3.0, -1.0, 0.0);
        let v = field.query(15.0, 25.0, 0.0);
        assert!((v.x - 3.0).abs() < 1e-6);
        assert!((v.y + 1.0).abs() < 1e-6);
    }

    #[test]
    fn blend_converges_between_old_average_and_new_sample() {
        let mut field = VelocityField::new(100, 100, 10);
        field.update(15.0, 25.0, 2.0, 0.0, 0.0);
        let before = field.query(15.0, 25.0, 0.0).x;
        field.update(15.0, 25.0, 6.0, 0.0, 0.0);
        let after = field.query(15.0, 25.0, 0.0).x;
        assert!(
            before < after && after < 6.0,
            "expected {before} < {after} < 6"
        );
        // Further identical samples keep pulling the average toward the sample.
        field.update(15.0, 25.0, 6.0, 0.0, 0.0);
        let later = field.query(15.0, 25.0, 0.0).x;
        assert!(after < later && later < 6.0);
    }

    #[test]
    fn buckets_are_independent() {
        let mut field = VelocityField::new(100, 100, 10);
        field.update(15.0, 25.0, 2.0, 0.0, 0.0);
        field.update(15.0, 25.0, 0.0, 2.0, 90.0);
        assert!(field.query(15.0, 25.0, 0.0).x > 0.0);
        assert_eq!(field.query(15.0, 25.0, 0.0).y, 0.0);
        assert!(field.query(15.0, 25.0, 90.0).y > 0.0);
        // A direction no sample has touched stays zero.
        assert_eq!(field.query(15.0, 25.0, 180.0), Vector2::zeros());
    }

    #[test]
    fn spread_tracks_sample_dispersion() {
        let mut field = VelocityField::new(100, 100, 10);
        field.update(15.0, 25.0, 4.0, 0.0, 0.0);
        // One sample: mean square equals the square, spread = v² - v.
        let s = field.spread(15.0, 25.0, 0.0);
        assert!((s.x - 12.0).abs() < 1e-4);
        // Identical repeated samples keep the spread near that fixpoint;
        // alternating ones push the mean square up relative to the mean.
        field.update(15.0, 25.0, -4.0, 0.0, 0.0);
        assert!(field.spread(15.0, 25.0, 0.0).x > s.x);
    }

    #[test]
    fn out_of_grid_positions_are_ignored() {
        let mut field = VelocityField::new(100, 100, 10);
        field.update(500.0, 25.0, 2.0, 0.0, 0.0);
        field.update(-3.0, 25.0, 2.0, 0.0, 0.0);
        assert_eq!(field.occupied_cells(), 0);
        assert_eq!(field.query(500.0, 25.0, 0.0), Vector2::zeros());
    }

    #[test]
    fn grid_dimensions_round_to_nearest() {
        let field = VelocityField::new(478, 644, 10);
        assert_eq!(field.rows(), 48);
        assert_eq!(field.cols(), 64);
    }

    #[test]
    fn snapshot_round_trip_preserves_velocities_and_resets_counters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("field.txt");

        let mut field = VelocityField::new(60, 80, 10);
        field.update(15.0, 25.0, 2.5, -1.25, 0.0);
        field.update(15.0, 25.0, 3.5, -0.75, 0.0);
        field.update(42.0, 8.0, 0.0, 4.0, 90.0);
        field.save(&path).expect("save snapshot");

        let restored = VelocityField::load(&path).expect("load snapshot");
        assert_eq!(restored.rows(), field.rows());
        assert_eq!(restored.cols(), field.cols());
        assert_eq!(restored.pitch(), field.pitch());
        assert_eq!(
            restored.query(15.0, 25.0, 0.0),
            field.query(15.0, 25.0, 0.0)
        );
        assert_eq!(
            restored.query(42.0, 8.0, 90.0),
            field.query(42.0, 8.0, 90.0)
        );
        // Sample history is not reconstructed: every cell restarts at 1.
        assert!(restored.cells.iter().all(|c| c.samples == 1));
        assert!(restored
            .cells
            .iter()
            .all(|c| c.mean_square == Vector2::zeros()));
    }

    #[test]
    fn missing_snapshot_falls_back_to_empty_field() {
        let field = VelocityField::load_or_new("/nonexistent/field.txt", 100, 200, 10);
        assert_eq!(field.rows(), 10);
        assert_eq!(field.cols(), 20);
        assert_eq!(field.occupied_cells(), 0);
    }

    #[test]
    fn ingest_feeds_samples_through_their_own_heading() {
        let mut field = VelocityField::new(100, 100, 10);
        let flows = [FlowSample {
            from: Vector2::new(15.0, 25.0),
            to: Vector2::new(19.0, 25.0),
        }];
        field.ingest(&flows);
        let v = field.query(15.0, 25.0, 0.0);
        assert!((v.x - 4.0).abs() < 1e-6);
    }
}
