use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};
use crate::patch_format::{BsdiffDiff, BsdiffExtra, Control};
use crate::pool::ReadSeek;
use crate::wire::ReadContext;

const CHUNK: usize = 64 * 1024;

/// Reads one bsdiff series from `ctx` and writes the `new_size` bytes it
/// describes to `out`, reading old bytes from `old`.
pub fn apply<R: Read, W: Write + ?Sized>(
    ctx: &mut ReadContext<R>,
    old: &mut dyn ReadSeek,
    out: &mut W,
    new_size: u64,
) -> Result<u64> {
    let mut controls = Vec::new();
    loop {
        let control: Control = ctx.read_message()?;
        if control.is_eof() {
            break;
        }
        controls.push(control);
    }
    let diff: BsdiffDiff = ctx.read_message()?;
    let extra: BsdiffExtra = ctx.read_message()?;

    let mut diff_pos = 0usize;
    let mut extra_pos = 0usize;
    let mut old_pos: i64 = 0;
    let mut new_pos: u64 = 0;
    let mut old_buf = vec![0u8; CHUNK];
    let mut out_buf = Vec::with_capacity(CHUNK);

    for control in &controls {
        if control.add < 0 || control.copy < 0 {
            return Err(Error::corrupt(format!("negative control lengths {control:?}")));
        }
        let (add, copy) = (control.add as u64, control.copy as u64);

        if new_pos.checked_add(add).is_none_or(|end| end > new_size) {
            return Err(Error::corrupt(format!(
                "add of {add} bytes at {new_pos} overruns new size {new_size}"
            )));
        }
        if add > 0 {
            if old_pos < 0 {
                return Err(Error::corrupt(format!("old pointer moved to {old_pos}")));
            }
            old.seek(SeekFrom::Start(old_pos as u64))?;
            let mut left = add as usize;
            while left > 0 {
                let n = left.min(CHUNK);
                let got = read_up_to(old, &mut old_buf[..n])?;
                // Past the end of old, diff bytes stand alone.
                old_buf[got..n].fill(0);
                let delta = diff
                    .bytes
                    .get(diff_pos..diff_pos + n)
                    .ok_or_else(|| Error::corrupt("diff buffer exhausted"))?;
                out_buf.clear();
                out_buf.extend(delta.iter().zip(&old_buf[..n]).map(|(d, o)| d.wrapping_add(*o)));
                out.write_all(&out_buf)?;
                diff_pos += n;
                left -= n;
            }
            new_pos += add;
            old_pos += control.add;
        }

        if new_pos.checked_add(copy).is_none_or(|end| end > new_size) {
            return Err(Error::corrupt(format!(
                "copy of {copy} bytes at {new_pos} overruns new size {new_size}"
            )));
        }
        let literal = extra
            .bytes
            .get(extra_pos..extra_pos + copy as usize)
            .ok_or_else(|| Error::corrupt("extra buffer exhausted"))?;
        out.write_all(literal)?;
        extra_pos += copy as usize;
        new_pos += copy;

        old_pos = old_pos
            .checked_add(control.seek)
            .ok_or_else(|| Error::corrupt("old pointer overflow"))?;
    }

    if new_pos != new_size {
        return Err(Error::corrupt(format!(
            "bsdiff series produced {new_pos} bytes, expected {new_size}"
        )));
    }
    Ok(new_pos)
}

fn read_up_to(reader: &mut dyn ReadSeek, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
