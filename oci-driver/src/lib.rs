//! # OCI content drivers
//!
//! The contract shared by every content store backend: the [`Driver`] trait,
//! the [`StoreError`] taxonomy, and the OCI data model (digests, descriptors,
//! image references and media types) that flows through it.

mod descriptor;
mod digest;
mod driver;
mod error;
mod event;
mod image;
pub mod media_type;

pub use descriptor::{Content, Descriptor, ImageIndex, ImageManifest, Platform};
pub use digest::{Digest, DigestError};
pub use driver::{Blob, BlobRead, Driver, RawManifest};
pub use error::{StoreError, StoreErrorBuilder, StoreErrorKind};
pub use event::{Event, EventKind, EventStream};
pub use image::{Image, ReferenceError};
pub use media_type::{determine_media_type, MediaKind, MediaTypeError};
