//! Multi-frame grid tracking network used by the export tooling.
//!
//! The network consumes a channel-first stack of RGB frames and predicts a
//! confidence and an (x, y) offset per grid cell for every frame.

pub mod error;
pub mod model;
pub mod weights;

pub use error::{NetError, Result};
pub use model::{
    AttrValue, CoreNetwork, Geometry, GridTrackNet, LayerRecord, NetArgs, Stage, DOWNSAMPLE, HEADS,
    RGB_CHANNELS,
};
