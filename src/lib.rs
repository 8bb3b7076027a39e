//! # bindery
//!
//! An ebook production pipeline: takes a publication's EPUB 3 source tree
//! and builds the distributable artifacts from it.
//!
//! - a pristine **EPUB 3** (the `_advanced` artifact),
//! - a **compatible EPUB 3** rewritten for legacy renderers (simplified
//!   CSS selectors, popup note semantics, NCX and guide fallbacks,
//!   rasterized vector art, chunked endnotes),
//! - optionally a **Kobo KEPUB** (sentence segmentation, in-flow notes),
//! - optionally a **Kindle AZW3** (via `ebook-convert`, with the ASIN
//!   patched into the EXTH header and a store thumbnail extracted).
//!
//! ## Quick Start
//!
//! ```no_run
//! use bindery::{build, BuildOptions, Toolbox};
//!
//! let options = BuildOptions {
//!     source_dir: "my-ebook".into(),
//!     output_dir: "dist".into(),
//!     kobo: true,
//!     kindle: true,
//!     check_only: false,
//! };
//! let tools = Toolbox::detect(options.kindle).unwrap();
//! let outcome = build(&options, &tools).unwrap();
//! for message in &outcome.messages {
//!     eprintln!("{message}");
//! }
//! ```
//!
//! External tools (`xmllint`, `epubcheck`, `rsvg-convert`, ImageMagick,
//! `ebook-convert`) are reached through the traits in [`tools`], so library
//! consumers and tests can substitute their own implementations.

pub mod assets;
pub mod build;
pub mod compat;
pub mod css;
pub mod dom;
pub mod endnotes;
pub mod epub;
pub mod error;
pub mod kobo;
pub mod mobi;
pub mod ncx;
pub mod store;
pub mod tools;

pub use build::{build, compatible_stage, BuildOptions, BuildOutcome};
pub use error::{Error, Result};
pub use store::{Document, SourceTree};
pub use tools::{BuildMessage, Severity, Toolbox};
