pub mod config;
pub mod contact;
pub mod estimation;
pub mod footstep;
pub mod geometry;
pub mod height;
pub mod icp;
pub mod push_recovery;
pub mod schedule;
pub mod walking;

pub use miette::Result;

/// The vidar prelude conveniently includes commonly needed types and traits for writing code
/// in the framework.
pub mod prelude {
    pub use crate::{
        Result,
        config::{Config, ConfigExt},
        footstep::Side,
        schedule::{ControlSet, ControlTick},
    };
}
