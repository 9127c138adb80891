//! rollcall-capture: frame acquisition for the check-in kiosk.
//!
//! The camera itself lives outside this workspace. Frames arrive as image
//! files (a spool directory written by the capture process, or a recorded
//! sequence for replay) and are surfaced through the [`FrameSource`] trait.

pub mod frame;
pub mod source;

pub use frame::{decode_image, is_dark_frame, Frame};
pub use source::{CaptureError, DirectorySource, FrameSource};
