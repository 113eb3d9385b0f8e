//! predict — position prediction and correction strategies
//!
//! Three estimator families behind one enum:
//!
//! - [`DynamicsPredictor`] — a linear-Gaussian filter over position and
//!   velocity (optionally acceleration), knowing nothing about the scene,
//!   refined by per-frame position measurements.
//! - [`FieldPredictor`] — no motion model of its own; walks along the
//!   averaged scene motion stored in the [`VelocityField`].
//! - [`FusionPredictor`] — fans every call out to a fixed set of the
//!   above and blends their centers with uniform weight.
//!
//! Heading angles are in degrees throughout, matching the field.

use nalgebra::{
    Matrix2, Matrix2x4, Matrix2x6, Matrix4, Matrix4x2, Matrix6, Matrix6x2, Vector2, Vector4,
    Vector6,
};

use crate::field::VelocityField;

// ── Model constants ──────────────────────────────────────────────────────────

/// Constant-velocity model: state transition time step.
const CV_TIME_STEP: f32 = 3.0;
/// Constant-velocity model: process noise, measurement noise, initial
/// error covariance (diagonal).
const CV_PROCESS_NOISE: f32 = 1e-4;
const CV_MEASUREMENT_NOISE: f32 = 1e2;
const CV_INITIAL_COVARIANCE: f32 = 1.0;

/// Constant-acceleration model equivalents.
const CA_TIME_STEP: f32 = 10.0;
const CA_PROCESS_NOISE: f32 = 1e-5;
const CA_MEASUREMENT_NOISE: f32 = 5e2;
const CA_INITIAL_COVARIANCE: f32 = 1e3;

// ── Dynamics-model estimator ─────────────────────────────────────────────────

/// Which motion model a [`DynamicsPredictor`] advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionModel {
    /// 4-state `[x, y, vx, vy]`.
    ConstantVelocity,
    /// 6-state `[x, y, vx, vy, ax, ay]`.
    ConstantAcceleration,
}

/// Kalman filter over a 4-dimensional constant-velocity state.
#[derive(Debug, Clone)]
struct Kalman4 {
    x_pre: Vector4<f32>,
    x_post: Vector4<f32>,
    p_pre: Matrix4<f32>,
    p_post: Matrix4<f32>,
    f: Matrix4<f32>,
    h: Matrix2x4<f32>,
    q: Matrix4<f32>,
    r: Matrix2<f32>,
}

impl Kalman4 {
    fn new() -> Self {
        let t = CV_TIME_STEP;
        #[rustfmt::skip]
        let f = Matrix4::new(
            1.0, 0.0,   t, 0.0,
            0.0, 1.0, 0.0,   t,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        #[rustfmt::skip]
        let h = Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        );
        Self {
            x_pre: Vector4::zeros(),
            x_post: Vector4::zeros(),
            p_pre: Matrix4::identity() * CV_INITIAL_COVARIANCE,
            p_post: Matrix4::identity() * CV_INITIAL_COVARIANCE,
            f,
            h,
            q: Matrix4::identity() * CV_PROCESS_NOISE,
            r: Matrix2::identity() * CV_MEASUREMENT_NOISE,
        }
    }

    fn set_position(&mut self, center: Vector2<f32>) {
        self.x_pre[0] = center.x;
        self.x_pre[1] = center.y;
        self.x_post[0] = center.x;
        self.x_post[1] = center.y;
    }

    fn predict(&mut self) {
        self.x_pre = self.f * self.x_post;
        self.p_pre = self.f * self.p_post * self.f.transpose() + self.q;
        // Prior becomes the working posterior until a measurement arrives,
        // so back-to-back predicts stay well defined.
        self.x_post = self.x_pre;
        self.p_post = self.p_pre;
    }

    fn correct(&mut self, z: Vector2<f32>) {
        let innovation = z - self.h * self.x_pre;
        let s = self.h * self.p_pre * self.h.transpose() + self.r;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let k: Matrix4x2<f32> = self.p_pre * self.h.transpose() * s_inv;
        self.x_post = self.x_pre + k * innovation;
        self.p_post = (Matrix4::identity() - k * self.h) * self.p_pre;
    }
}

/// Kalman filter over a 6-dimensional constant-acceleration state.
#[derive(Debug, Clone)]
struct Kalman6 {
    x_pre: Vector6<f32>,
    x_post: Vector6<f32>,
    p_pre: Matrix6<f32>,
    p_post: Matrix6<f32>,
    f: Matrix6<f32>,
    h: Matrix2x6<f32>,
    q: Matrix6<f32>,
    r: Matrix2<f32>,
}

impl Kalman6 {
    fn new() -> Self {
        let t = CA_TIME_STEP;
        #[rustfmt::skip]
        let f = Matrix6::new(
            1.0, 0.0,   t, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0,   t, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,   t, 0.0,
            0.0, 0.0, 0.0, 1.0, 0.0,   t,
            0.0, 0.0, 0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 0.0, 0.0, 1.0,
        );
        #[rustfmt::skip]
        let h = Matrix2x6::new(
            1.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0, 0.0, 0.0,
        );
        Self {
            x_pre: Vector6::zeros(),
            x_post: Vector6::zeros(),
            p_pre: Matrix6::identity() * CA_INITIAL_COVARIANCE,
            p_post: Matrix6::identity() * CA_INITIAL_COVARIANCE,
            f,
            h,
            q: Matrix6::identity() * CA_PROCESS_NOISE,
            r: Matrix2::identity() * CA_MEASUREMENT_NOISE,
        }
    }

    fn set_position(&mut self, center: Vector2<f32>) {
        self.x_pre[0] = center.x;
        self.x_pre[1] = center.y;
        self.x_post[0] = center.x;
        self.x_post[1] = center.y;
    }

    fn predict(&mut self) {
        self.x_pre = self.f * self.x_post;
        self.p_pre = self.f * self.p_post * self.f.transpose() + self.q;
        self.x_post = self.x_pre;
        self.p_post = self.p_pre;
    }

    fn correct(&mut self, z: Vector2<f32>) {
        let innovation = z - self.h * self.x_pre;
        let s = self.h * self.p_pre * self.h.transpose() + self.r;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let k: Matrix6x2<f32> = self.p_pre * self.h.transpose() * s_inv;
        self.x_post = self.x_pre + k * innovation;
        self.p_post = (Matrix6::identity() - k * self.h) * self.p_pre;
    }
}

enum KalmanState {
    ConstantVelocity(Box<Kalman4>),
    ConstantAcceleration(Box<Kalman6>),
}

/// Dynamics-model estimator: a Kalman filter in one of two fixed
/// configurations.  The heading angle is part of the shared predictor
/// contract but carries no information for this variant.
pub struct DynamicsPredictor {
    state: KalmanState,
}

impl DynamicsPredictor {
    pub fn new(model: MotionModel) -> Self {
        let state = match model {
            MotionModel::ConstantVelocity => {
                KalmanState::ConstantVelocity(Box::new(Kalman4::new()))
            }
            MotionModel::ConstantAcceleration => {
                KalmanState::ConstantAcceleration(Box::new(Kalman6::new()))
            }
        };
        Self { state }
    }

    pub fn model(&self) -> MotionModel {
        match self.state {
            KalmanState::ConstantVelocity(_) => MotionModel::ConstantVelocity,
            KalmanState::ConstantAcceleration(_) => MotionModel::ConstantAcceleration,
        }
    }

    fn set_initial_position(&mut self, center: Vector2<f32>) {
        match &mut self.state {
            KalmanState::ConstantVelocity(k) => k.set_position(center),
            KalmanState::ConstantAcceleration(k) => k.set_position(center),
        }
    }

    fn predict(&mut self) {
        match &mut self.state {
            KalmanState::ConstantVelocity(k) => k.predict(),
            KalmanState::ConstantAcceleration(k) => k.predict(),
        }
    }

    fn correct(&mut self, center: Vector2<f32>) {
        match &mut self.state {
            KalmanState::ConstantVelocity(k) => k.correct(center),
            KalmanState::ConstantAcceleration(k) => k.correct(center),
        }
    }

    fn predicted_center(&self) -> Vector2<f32> {
        match &self.state {
            KalmanState::ConstantVelocity(k) => Vector2::new(k.x_pre[0], k.x_pre[1]),
            KalmanState::ConstantAcceleration(k) => Vector2::new(k.x_pre[0], k.x_pre[1]),
        }
    }

    fn corrected_center(&self) -> Vector2<f32> {
        match &self.state {
            KalmanState::ConstantVelocity(k) => Vector2::new(k.x_post[0], k.x_post[1]),
            KalmanState::ConstantAcceleration(k) => Vector2::new(k.x_post[0], k.x_post[1]),
        }
    }
}

// ── Field-lookup estimator ───────────────────────────────────────────────────

/// Stateless beyond the object's own position: each predict step adds the
/// field's averaged motion vector at the current position and heading to
/// the accumulated predicted position.
#[derive(Debug, Clone, Default)]
pub struct FieldPredictor {
    position: Vector2<f32>,
    predicted: Vector2<f32>,
}

impl FieldPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_initial_position(&mut self, center: Vector2<f32>) {
        self.position = center;
        self.predicted = center;
    }

    fn predict(&mut self, field: &VelocityField, heading: f32) {
        self.predicted += field.query(self.position.x, self.position.y, heading);
    }

    /// No filtering: both positions snap to the measurement.
    fn correct(&mut self, center: Vector2<f32>) {
        self.position = center;
        self.predicted = center;
    }
}

// ── Fusion estimator ─────────────────────────────────────────────────────────

/// Which sub-predictors a [`FusionPredictor`] owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionTopology {
    /// One constant-velocity filter plus one field lookup.
    SingleKalmanSingleField,
    /// Constant-velocity and constant-acceleration filters plus one field
    /// lookup.
    #[default]
    DoubleKalmanSingleField,
}

/// Fans every call out to an ordered set of sub-predictors.
///
/// Both center getters report the uniformly weighted blend of the
/// sub-predictors' *predicted* centers.  Keeping the corrected getter on
/// the predicted values is a deliberate module-level decision: the blend
/// stays continuous across frames without a measurement, and the entity
/// layer re-anchors the geometry from the detection itself on every match.
pub struct FusionPredictor {
    subs: Vec<Predictor>,
}

impl FusionPredictor {
    pub fn new(topology: FusionTopology) -> Self {
        let subs = match topology {
            FusionTopology::SingleKalmanSingleField => vec![
                Predictor::Dynamics(DynamicsPredictor::new(MotionModel::ConstantVelocity)),
                Predictor::Field(FieldPredictor::new()),
            ],
            FusionTopology::DoubleKalmanSingleField => vec![
                Predictor::Dynamics(DynamicsPredictor::new(MotionModel::ConstantVelocity)),
                Predictor::Dynamics(DynamicsPredictor::new(MotionModel::ConstantAcceleration)),
                Predictor::Field(FieldPredictor::new()),
            ],
        };
        Self { subs }
    }

    fn blended_predicted_center(&self) -> Vector2<f32> {
        let coefficient = 1.0 / self.subs.len() as f32;
        self.subs
            .iter()
            .fold(Vector2::zeros(), |acc, sub| {
                acc + sub.predicted_center() * coefficient
            })
    }
}

// ── Shared contract ──────────────────────────────────────────────────────────

/// A position prediction/correction strategy.
pub enum Predictor {
    Dynamics(DynamicsPredictor),
    Field(FieldPredictor),
    Fusion(FusionPredictor),
}

impl Predictor {
    /// Build the default per-entity predictor for a given fusion topology.
    pub fn fused(topology: FusionTopology) -> Self {
        Predictor::Fusion(FusionPredictor::new(topology))
    }

    pub fn set_initial_position(&mut self, center: Vector2<f32>) {
        match self {
            Predictor::Dynamics(p) => p.set_initial_position(center),
            Predictor::Field(p) => p.set_initial_position(center),
            Predictor::Fusion(p) => {
                for sub in &mut p.subs {
                    sub.set_initial_position(center);
                }
            }
        }
    }

    /// Advance the prediction one frame.  `heading` is in degrees; only the
    /// field-lookup strategy consumes it.
    pub fn predict(&mut self, field: &VelocityField, heading: f32) {
        match self {
            Predictor::Dynamics(p) => p.predict(),
            Predictor::Field(p) => p.predict(field, heading),
            Predictor::Fusion(p) => {
                for sub in &mut p.subs {
                    sub.predict(field, heading);
                }
            }
        }
    }

    /// Refine the state with a position measurement.
    pub fn correct(&mut self, center: Vector2<f32>) {
        match self {
            Predictor::Dynamics(p) => p.correct(center),
            Predictor::Field(p) => p.correct(center),
            Predictor::Fusion(p) => {
                for sub in &mut p.subs {
                    sub.correct(center);
                }
            }
        }
    }

    pub fn predicted_center(&self) -> Vector2<f32> {
        match self {
            Predictor::Dynamics(p) => p.predicted_center(),
            Predictor::Field(p) => p.predicted,
            Predictor::Fusion(p) => p.blended_predicted_center(),
        }
    }

    pub fn corrected_center(&self) -> Vector2<f32> {
        match self {
            Predictor::Dynamics(p) => p.corrected_center(),
            Predictor::Field(p) => p.position,
            Predictor::Fusion(p) => p.blended_predicted_center(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_field() -> VelocityField {
        VelocityField::new(480, 640, 10)
    }

    #[test]
    fn dynamics_stays_put_without_motion_evidence() {
        let field = empty_field();
        let mut p = Predictor::Dynamics(DynamicsPredictor::new(MotionModel::ConstantVelocity));
        p.set_initial_position(Vector2::new(100.0, 50.0));
        p.predict(&field, 0.0);
        let c = p.predicted_center();
        assert!((c.x - 100.0).abs() < 1e-3);
        assert!((c.y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn dynamics_learns_a_constant_velocity() {
        let field = empty_field();
        let mut p = Predictor::Dynamics(DynamicsPredictor::new(MotionModel::ConstantVelocity));
        p.set_initial_position(Vector2::new(0.0, 0.0));
        // Feed measurements marching right at 5 px/frame.
        let mut last_predicted_x = 0.0;
        for frame in 1..=30 {
            p.predict(&field, 0.0);
            p.correct(Vector2::new(5.0 * frame as f32, 0.0));
            last_predicted_x = p.predicted_center().x;
        }
        p.predict(&field, 0.0);
        assert!(
            p.predicted_center().x > last_predicted_x,
            "prediction should extrapolate forward once velocity is learned"
        );
        // The corrected state hugs the measurements.
        assert!((p.corrected_center().y).abs() < 1.0);
    }

    #[test]
    fn dynamics_correct_pulls_toward_measurement() {
        let field = empty_field();
        let mut p = Predictor::Dynamics(DynamicsPredictor::new(MotionModel::ConstantAcceleration));
        p.set_initial_position(Vector2::new(10.0, 10.0));
        p.predict(&field, 0.0);
        p.correct(Vector2::new(30.0, 10.0));
        let c = p.corrected_center();
        assert!(c.x > 10.0 && c.x < 30.0, "corrected x = {}", c.x);
    }

    #[test]
    fn field_predictor_accumulates_field_motion() {
        let mut field = empty_field();
        // Rightward motion averaged into the cell holding (100, 50).
        field.update(100.0, 50.0, 4.0, 0.0, 0.0);
        let mut p = Predictor::Field(FieldPredictor::new());
        p.set_initial_position(Vector2::new(100.0, 50.0));
        p.predict(&field, 0.0);
        p.predict(&field, 0.0);
        let c = p.predicted_center();
        assert!((c.x - 108.0).abs() < 1e-4, "two steps of +4, got {}", c.x);
        assert_eq!(c.y, 50.0);
        // Correction snaps both centers to the measurement.
        p.correct(Vector2::new(70.0, 70.0));
        assert_eq!(p.predicted_center(), Vector2::new(70.0, 70.0));
        assert_eq!(p.corrected_center(), Vector2::new(70.0, 70.0));
    }

    #[test]
    fn fusion_blends_member_predictions_uniformly() {
        let mut field = empty_field();
        field.update(100.0, 50.0, 6.0, 0.0, 0.0);
        let mut p = Predictor::fused(FusionTopology::SingleKalmanSingleField);
        p.set_initial_position(Vector2::new(100.0, 50.0));
        p.predict(&field, 0.0);
        // Kalman member stays at 100, field member moves to 106: blend 103.
        let c = p.predicted_center();
        assert!((c.x - 103.0).abs() < 1e-3, "got {}", c.x);
        assert!((c.y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn fusion_center_getters_agree() {
        let mut field = empty_field();
        field.update(100.0, 50.0, 6.0, 0.0, 0.0);
        let mut p = Predictor::fused(FusionTopology::DoubleKalmanSingleField);
        p.set_initial_position(Vector2::new(100.0, 50.0));
        p.predict(&field, 0.0);
        p.correct(Vector2::new(104.0, 50.0));
        assert_eq!(p.predicted_center(), p.corrected_center());
    }

    #[test]
    fn topology_controls_sub_predictor_set() {
        let Predictor::Fusion(single) = Predictor::fused(FusionTopology::SingleKalmanSingleField)
        else {
            unreachable!()
        };
        let Predictor::Fusion(double) = Predictor::fused(FusionTopology::DoubleKalmanSingleField)
        else {
            unreachable!()
        };
        assert_eq!(single.subs.len(), 2);
        assert_eq!(double.subs.len(), 3);
        let models: Vec<_> = double
            .subs
            .iter()
            .filter_map(|s| match s {
                Predictor::Dynamics(d) => Some(d.model()),
                _ => None,
            })
            .collect();
        assert_eq!(
            models,
            vec![
                MotionModel::ConstantVelocity,
                MotionModel::ConstantAcceleration
            ]
        );
    }
}
