//! Imagepipe - an asynchronous image fetch pipeline.
//!
//! Images are resolved from a memory cache, a disk cache, host-registered
//! additional caches and finally the network. Concurrent requests for the
//! same image share one fetch, and observers receive ordered callbacks for
//! previews, progressive partials, progress and the final result.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing the pipeline and its adapters.
pub mod infrastructure;

/// Current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = "imagepipe";
