//! The core, UI-agnostic library for the `imprint` image writer.
//!
//! `imprint-core` writes one disk image to one or more removable devices and
//! guarantees that what ends up on each device is what the image contains. It
//! is meant to be driven by any front end, whether a command-line interface
//! (like `imprint`) or a graphical one.
//!
//! The library is structured into several key modules:
//! - [`device`] and [`platform`]: the [`TargetDevice`] description and the
//!   discovery of removable devices.
//! - [`handle`] and [`backend`]: exclusive, offset-addressed access to a device.
//! - [`image`]: the read-only [`ImageSource`], decompressed and checksummed once.
//! - [`plan`] and [`state`]: the fixed chunk layout of a transfer and the
//!   resumable record of which chunks are written and verified.
//! - [`thermal`]: pausing or stopping a transfer when the machine runs hot.
//! - [`verify`]: reading written chunks back and comparing them with the image.
//! - [`coordinator`]: [`start_job`], which runs one engine per device.
//!
//! Progress is published as a stream of [`ProgressEvent`]s, so the caller is
//! free to display it in any way it chooses.
//!
//! ## Example: Writing an Image to Every Removable Device
//!
//! ```rust,no_run
//! use imprint_core::{
//!     backend::SystemBackend, platform, start_job, state::JsonFileStore, ImageSource,
//!     JobContext, JobOptions,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let image = Arc::new(ImageSource::open(Path::new("path/to/image.img.xz"))?);
//!     let devices = platform::get_removable_devices()?;
//!
//!     let store = JsonFileStore::new("/var/tmp/imprint-state")?;
//!     let ctx = JobContext::new(Arc::new(SystemBackend), Arc::new(store));
//!     let job = start_job(image, devices, JobOptions::default(), ctx)?;
//!
//!     // A real app might feed these into progress bar widgets.
//!     for event in job.subscribe_progress() {
//!         println!("{}: {} {:.1}%", event.device, event.phase, event.percentage());
//!     }
//!
//!     for result in job.wait().results {
//!         println!("{result}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod device;
mod engine;
pub mod error;
pub mod handle;
pub mod image;
pub mod manifest;
pub mod plan;
pub mod platform;
pub mod progress;
pub mod report;
mod retry;
pub mod state;
pub mod thermal;
pub mod verify;

pub use config::JobOptions;
pub use coordinator::{JobContext, JobHandle, start_job};
pub use device::TargetDevice;
pub use image::ImageSource;
pub use progress::{ProgressEvent, ProgressStream};
pub use report::{JobOutcome, JobReport, JobResult, Verification};
pub use retry::RetryPolicy;
