mod decision;
mod guidance;
mod merge;
mod slice;

pub use decision::{select_reflection_action, should_trigger_reflector};
pub use guidance::{
    MAX_COMPRESSION_LEVEL, reflector_compression_guidance, validate_reflection_compression,
};
pub use merge::merge_buffered_reflection;
pub use slice::plan_buffered_reflection_slice;
