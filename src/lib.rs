//! Binary deltas between directory trees.
//!
//! A patch turns a *target* tree (what the user has) into a *source* tree
//! (what they should have). [`create`] writes patches from a target
//! [`signature::Signature`] and the source files, [`apply`] replays them into
//! a [`bowl::Bowl`], [`rediff`] re-encodes rsync series as bsdiff, and
//! [`validate`] with [`heal`] check and repair an installed tree.

pub mod apply;
pub mod bowl;
pub mod bsdiff;
pub mod cancel;
pub mod container;
pub mod create;
pub mod error;
pub mod heal;
pub mod patch_format;
pub mod pool;
pub mod rediff;
pub mod retry;
pub mod rolling_hash;
pub mod rsync;
pub mod signature;
pub mod suffix;
pub mod util;
pub mod validate;
pub mod wire;

pub use error::{Error, ErrorKind, Result};
