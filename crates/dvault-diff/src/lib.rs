//! # dvault-diff
//!
//! Byte-level edit scripts for dvault's version compactor.
//!
//! - [`diff`]: Myers' O(ND) difference algorithm with an optional edit ceiling
//! - [`EditScript`]: delete / insert / copy instructions and their application
//!
//! A script-form version stores only the [`EditScript`] that rebuilds it from
//! the newest block-form version before it.
//!
//! ```
//! use dvault_diff::{diff, DiffOptions};
//!
//! let script = diff(b"AAAABBBB", b"AAAABBBX", DiffOptions::default()).unwrap();
//! assert_eq!(script.apply(b"AAAABBBB").unwrap(), b"AAAABBBX");
//! ```

pub mod myers;
pub mod script;

pub use myers::{diff, DiffOptions, DiffTooLarge};
pub use script::{EditOp, EditScript, ScriptError};
