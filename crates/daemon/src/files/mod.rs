//! Read-only file browsing.
//!
//! All path operations are validated against the configured roots. Path
//! traversal is prevented by canonicalizing every path before the check.

pub mod browser;

pub use browser::{BrowserError, DirectoryBrowser, DirectoryEntry, EntryType, FileContent, Listing};
