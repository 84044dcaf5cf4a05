//! Shared data models for timing appliances

mod alarm;
mod image;
mod priority;
mod reference;
mod state;
mod sync;

pub use alarm::*;
pub use image::*;
pub use priority::*;
pub use reference::*;
pub use state::*;
pub use sync::*;
