pub mod background;
pub mod stub;

pub use background::{BackgroundSubtractor, SubtractorSettings};
pub use stub::StubDetector;
