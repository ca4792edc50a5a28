pub mod adjust;
pub mod crop;
pub mod masks;
pub mod rotate;
pub mod tone_curve;

pub use adjust::{DevelopParams, TONE_LUT_SIZE, adjust, build_tone_lut};
pub use crop::crop;
pub use masks::{apply_masks, linear_weight, radial_weight};
pub use rotate::rotate;
pub use tone_curve::{apply_tone_curve, curve_lut};
