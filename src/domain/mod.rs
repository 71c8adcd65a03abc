//! Domain layer with core entities and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{ImageContainer, ImageId, ImageRequest, LoadedImage};
pub use errors::{FetchError, FetchResult};
pub use ports::{FetchDelegate, PreviewDecision};
