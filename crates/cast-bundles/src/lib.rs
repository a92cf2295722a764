//! cast-bundles: application bundle storage.
//!
//! Bundles arrive as gzipped tarballs, are checksummed while streamed to a
//! temp file, extracted and manifest-checked, and only then moved into the
//! bundle and extracted directories.

pub mod error;
pub mod extract;
pub mod store;
pub mod tempfiles;

pub use error::{BundleError, BundleResult};
pub use store::{
    ApplicationInfo, BUNDLE_MANAGER, Bundle, BundleInfo, BundleJob, BundleLayout, BundleStore,
    BundleStream, ChecksumSource, expect_sha1, sha1_hex,
};
pub use tempfiles::{TEMP_FILE_MANAGER, TempFileManager, TempPath};
