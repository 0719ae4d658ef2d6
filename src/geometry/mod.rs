//! Geometry utilities: SE3 and Sim3 transforms.

pub mod se3;
pub mod sim3;

pub use se3::SE3;
pub use sim3::Sim3;
