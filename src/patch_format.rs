//! Message schemas carried by patch and signature files.
//!
//! Every message is framed as `u32 length | bincode bytes` by the wire layer;
//! this module only defines what goes inside the frames.

use serde::{Deserialize, Serialize};

use crate::wire::CompressionSettings;

/// Magic of a patch file (`0x0FEF5F00 | 1`).
pub const PATCH_MAGIC: u32 = 0x0FEF_5F00 + 1;

/// Magic of a signature file (`0x0FEF5F00 | 2`).
pub const SIGNATURE_MAGIC: u32 = 0x0FEF_5F00 + 2;

/// Size of an rsync block. Changing it breaks every patch and signature.
pub const BLOCK_SIZE: u64 = 64 * 1024;

/// Largest literal carried by a single `Data` op.
pub const MAX_DATA_OP: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHeader {
    pub compression: CompressionSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureHeader {
    pub compression: CompressionSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    Rsync = 0,
    Bsdiff = 1,
}

/// Announces the series that rebuilds source file `file_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHeader {
    pub file_index: i64,
    pub kind: SyncKind,
}

/// One rsync operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOp {
    /// Copy `block_span` consecutive blocks of target file `file_index`,
    /// starting at `block_index`.
    BlockRange {
        file_index: i64,
        block_index: i64,
        block_span: i64,
    },
    /// Literal bytes.
    Data(Vec<u8>),
    /// End of the per-file series.
    HeyYouDidIt,
}

/// Names the target file a bsdiff series is computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BsdiffHeader {
    pub target_index: i64,
}

/// Bsdiff control record: add `add` diff bytes onto old, copy `copy` extra
/// bytes, then move the old pointer by `seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    pub add: i64,
    pub copy: i64,
    pub seek: i64,
    pub eof: bool,
}

impl Control {
    /// Terminates the control series. Carries both markers so readers can
    /// rely on either one.
    pub const EOF: Control = Control {
        add: -1,
        copy: 0,
        seek: 0,
        eof: true,
    };

    pub fn is_eof(&self) -> bool {
        self.eof || self.add == -1
    }
}

/// Concatenated add bytes of a bsdiff series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BsdiffDiff {
    pub bytes: Vec<u8>,
}

/// Concatenated copy bytes of a bsdiff series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BsdiffExtra {
    pub bytes: Vec<u8>,
}

/// Signature record for one block of one file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash {
    pub file_index: i64,
    pub block_index: i64,
    pub weak_hash: u32,
    pub strong_hash: Vec<u8>,
    /// Non-zero only for a tail block shorter than [`BLOCK_SIZE`].
    pub short_size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WoundKind {
    File,
    ClosedFile,
}

/// A byte range of the reconstructed tree that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wound {
    pub file_index: i64,
    pub start: i64,
    pub end: i64,
    pub kind: WoundKind,
}

impl Wound {
    pub fn size(&self) -> i64 {
        self.end - self.start
    }
}

/// Number of blocks in a file of `file_size` bytes: zero for empty files,
/// `ceil(size / BLOCK_SIZE)` otherwise.
pub fn compute_num_blocks(file_size: u64) -> u64 {
    file_size.div_ceil(BLOCK_SIZE)
}

/// Size of block `block_index` in a file of `file_size` bytes.
pub fn compute_block_size(file_size: u64, block_index: u64) -> u64 {
    BLOCK_SIZE.min(file_size.saturating_sub(block_index * BLOCK_SIZE))
}

/// Per-run counters reported by the CLI.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub files_patched: usize,
    pub files_transposed: usize,
    pub files_bsdiffed: usize,
    pub bytes_written: u64,
}
