//! Protocol module - JSON frame shapes and classification.
//!
//! Frames are UTF-8 JSON text messages; see [`Frame`] for the three shapes.

mod frame;

pub use frame::{Broadcast, ErrorObject, Frame, Request, Response};
