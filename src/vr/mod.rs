pub mod capabilities;
pub mod input;
#[cfg(all(feature = "vr-openxr", target_os = "android"))]
pub mod openxr;
pub mod runtime;
pub mod session;
pub mod simulated;

use crate::render::GraphicsError;
use serde::{Deserialize, Serialize};
use std::ops::{Add, Neg};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector2f {
    pub x: f32,
    pub y: f32,
}

impl Vector2f {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3f {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    fn cross(self, rhs: Self) -> Self {
        Self::new(
            self.y * rhs.z - self.z * rhs.y,
            self.z * rhs.x - self.x * rhs.z,
            self.x * rhs.y - self.y * rhs.x,
        )
    }

    fn scale(self, factor: f32) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }
}

impl Add for Vector3f {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Neg for Vector3f {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternionf {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quaternionf {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    /// Rotation of `radians` about +Y (the tracking-space up axis).
    pub fn from_yaw(radians: f32) -> Self {
        let half = radians * 0.5;
        Self {
            x: 0.0,
            y: half.sin(),
            z: 0.0,
            w: half.cos(),
        }
    }

    pub fn yaw(&self) -> f32 {
        let siny = 2.0 * (self.w * self.y + self.x * self.z);
        let cosy = 1.0 - 2.0 * (self.x * self.x + self.y * self.y);
        siny.atan2(cosy)
    }

    pub fn conjugate(self) -> Self {
        Self {
            x: -self.x,
            y: -self.y,
            z: -self.z,
            w: self.w,
        }
    }

    pub fn mul(self, rhs: Self) -> Self {
        Self {
            x: self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            y: self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            z: self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
            w: self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
        }
    }

    pub fn rotate(self, v: Vector3f) -> Vector3f {
        let axis = Vector3f::new(self.x, self.y, self.z);
        let t = axis.cross(v).scale(2.0);
        v + t.scale(self.w) + axis.cross(t)
    }
}

impl Default for Quaternionf {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Posef {
    pub orientation: Quaternionf,
    pub position: Vector3f,
}

impl Posef {
    pub const IDENTITY: Self = Self {
        orientation: Quaternionf::IDENTITY,
        position: Vector3f::ZERO,
    };

    pub fn new(orientation: Quaternionf, position: Vector3f) -> Self {
        Self {
            orientation,
            position,
        }
    }

    /// `self * local`: expresses a pose given relative to `self` in `self`'s parent space.
    pub fn compose(self, local: Posef) -> Posef {
        Posef {
            orientation: self.orientation.mul(local.orientation),
            position: self.position + self.orientation.rotate(local.position),
        }
    }

    pub fn inverse(self) -> Posef {
        let orientation = self.orientation.conjugate();
        Posef {
            orientation,
            position: -orientation.rotate(self.position),
        }
    }

    /// Same position, orientation flattened to its rotation about the up axis.
    pub fn heading(self) -> Posef {
        Posef {
            orientation: Quaternionf::from_yaw(self.orientation.yaw()),
            position: self.position,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Fovf {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl Fovf {
    pub fn symmetric(half_angle: f32) -> Self {
        Self {
            angle_left: -half_angle,
            angle_right: half_angle,
            angle_up: half_angle,
            angle_down: -half_angle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpaceLocation {
    pub pose: Posef,
    pub position_valid: bool,
    pub orientation_valid: bool,
}

impl SpaceLocation {
    pub fn tracked(pose: Posef) -> Self {
        Self {
            pose,
            position_valid: true,
            orientation_valid: true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.position_valid && self.orientation_valid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct View {
    pub pose: Posef,
    pub fov: Fovf,
}

/// Predicted display time in runtime nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(i64);

impl Time {
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum XrError {
    #[error("{call} failed: {name} ({code})")]
    Runtime {
        call: &'static str,
        code: i32,
        name: String,
    },
    #[error("required extension {0} is not available")]
    MissingExtension(&'static str),
    #[error("runtime does not offer a primary stereo view configuration")]
    NoStereoViewConfiguration,
    #[error("runtime reported no reference spaces")]
    NoReferenceSpaces,
    #[error("graphics API {found} outside runtime range {min}..={max}")]
    GraphicsVersion { found: u32, min: u32, max: u32 },
    #[error("graphics context: {0}")]
    Graphics(#[from] GraphicsError),
    #[error("input: {0}")]
    Input(#[from] input::InputError),
    #[error("{0} called out of order")]
    Lifecycle(&'static str),
}

impl XrError {
    pub fn runtime(call: &'static str, code: i32, name: impl Into<String>) -> Self {
        XrError::Runtime {
            call,
            code,
            name: name.into(),
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            XrError::Runtime { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type XrResult<T> = Result<T, XrError>;

pub trait XrResultExt<T> {
    /// Logs a failure together with the caller's source location, then hands the result back.
    fn logged(self) -> XrResult<T>;
}

impl<T> XrResultExt<T> for XrResult<T> {
    #[track_caller]
    fn logged(self) -> XrResult<T> {
        if let Err(err) = &self {
            let site = std::panic::Location::caller();
            log::error!("[xr] {err} at {}:{}", site.file(), site.line());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn heading_keeps_only_yaw() {
        let yaw = Quaternionf::from_yaw(0.75);
        let pitch = Quaternionf {
            x: (0.3f32).sin(),
            y: 0.0,
            z: 0.0,
            w: (0.3f32).cos(),
        };
        let pose = Posef::new(yaw.mul(pitch), Vector3f::new(1.0, 1.6, -2.0));
        let heading = pose.heading();

        assert!(approx(heading.orientation.yaw(), 0.75));
        assert!(approx(heading.orientation.x, 0.0));
        assert!(approx(heading.orientation.z, 0.0));
        assert_eq!(heading.position, pose.position);
    }

    #[test]
    fn compose_with_inverse_is_identity() {
        let pose = Posef::new(Quaternionf::from_yaw(1.2), Vector3f::new(0.5, 1.0, 2.0));
        let round = pose.inverse().compose(pose);

        assert!(approx(round.position.x, 0.0));
        assert!(approx(round.position.y, 0.0));
        assert!(approx(round.position.z, 0.0));
        assert!(approx(round.orientation.w.abs(), 1.0));
    }

    #[test]
    fn rotate_quarter_turn_about_up() {
        let quarter = Quaternionf::from_yaw(std::f32::consts::FRAC_PI_2);
        let rotated = quarter.rotate(Vector3f::new(0.0, 0.0, -1.0));

        assert!(approx(rotated.x, -1.0));
        assert!(approx(rotated.z, 0.0));
    }

    #[test]
    fn runtime_error_reports_call_and_code() {
        let err = XrError::runtime("xrWaitFrame", -2, "XR_ERROR_RUNTIME_FAILURE");
        assert_eq!(err.code(), Some(-2));
        assert!(err.to_string().contains("xrWaitFrame"));
    }
}
