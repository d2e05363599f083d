//! # Mono Image
//!
//! The image processing used by the monocular tracker: padded 8 bit grayscale frames, frame
//! pyramids, Harris corners, a pyramidal patch tracker and a FREAK style binary descriptor.
//!
//! ```
//! use mono_image::{Frame, FramePyramid, HarrisDetector};
//!
//! let frame = Frame::from_fn(64, 64, |x, y| if x > 20 && y > 20 { 200 } else { 40 }).unwrap();
//! let pyramid = FramePyramid::new(&frame, 3).unwrap();
//! assert_eq!(pyramid.len(), 3);
//! let corners = HarrisDetector::new(20.0).detect(pyramid.finest());
//! assert!(!corners.is_empty());
//! ```

pub mod descriptor;
mod frame;
mod harris;
mod pyramid;
mod tracker;

pub use descriptor::Descriptor;
pub use frame::*;
pub use harris::*;
pub use pyramid::*;
pub use tracker::*;
