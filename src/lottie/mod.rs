//! Lottie compositions: JSON model, animated values, evaluated scene and CPU rasterizer.

pub mod model;
pub mod render;
pub mod scene;
pub mod value;

pub use model::{CompositionModel, parse_composition};
pub use render::LottieRasterizer;
pub use scene::{DrawLayer, DrawOp, Scene};
pub use value::{Animated, BezierShape, CubicEase, Keyframe, Lerp};
