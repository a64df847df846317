//! Data structures representing format components.
//!
//! Contains the block header, sub-chunk framing and the per-stream state
//! each sub-chunk loads: decorrelation passes, entropy medians, the hybrid
//! profile and the float/int32 post-processing parameters.

pub mod block;
pub mod decorrelation;
pub mod descriptor;
pub mod entropy;
pub mod float;
pub mod header;
pub mod hybrid;
pub mod metadata;
pub mod wrapper;
