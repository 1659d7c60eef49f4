use std::fs;
use std::io;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Error, Result, ResultExt};

/// Width of the strong block hash, in bytes.
pub const STRONG_HASH_SIZE: usize = 16;

/// Relative path of `full` under `root`, with forward slashes for
/// cross-platform consistency in the patch format.
pub fn relative_slash_path(root: &Path, full: &Path) -> Result<String> {
    let relative = full.strip_prefix(root).map_err(|_| {
        Error::malformed(format!(
            "{} is not under {}",
            full.display(),
            root.display()
        ))
    })?;
    let relative = relative
        .to_str()
        .ok_or_else(|| Error::malformed(format!("non-UTF8 path: {}", relative.display())))?;
    Ok(relative.replace('\\', "/"))
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    // SAFETY: We only read from this mapping; pools never rewrite a file they read from.
    unsafe { Mmap::map(&file).with_context(|| format!("memory-mapping {}", path.display())) }
}

/// Strong block hash: BLAKE3 truncated to [`STRONG_HASH_SIZE`] bytes.
pub fn strong_hash(data: &[u8]) -> Vec<u8> {
    blake3::hash(data).as_bytes()[..STRONG_HASH_SIZE].to_vec()
}

#[cfg(unix)]
pub fn permission_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn permission_bits(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting mode {mode:o} on {}", path.display()))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
pub fn symlink(dest: &str, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(dest, link)
        .with_context(|| format!("creating symlink {} -> {dest}", link.display()))
}

#[cfg(not(unix))]
pub fn symlink(dest: &str, link: &Path) -> Result<()> {
    tracing::warn!(link = %link.display(), %dest, "symlinks unsupported on this platform, skipping");
    Ok(())
}

/// Removes a file, symlink or directory tree. Missing entries are fine.
pub fn remove_entry(path: &Path) -> Result<()> {
    let res = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)).with_context(|| format!("removing {}", path.display())),
    }
}

/// Sort directory paths so children come before parents (for deletion).
pub fn sort_dirs_deepest_first(dirs: &mut [String]) {
    dirs.sort();
    dirs.reverse();
}
