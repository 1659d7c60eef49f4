use std::sync::atomic::{AtomicI32, Ordering};

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::suffix::{check_input_size, SortConcurrency};

/// Sorts the suffixes of `data` by prefix doubling with ternary splits.
///
/// Returns `data.len()` suffix start positions in lexicographic order.
///
/// Each pass reads group numbers from `v` and writes refined ones into a
/// copy, so the unsorted groups of a pass are independent and can be split
/// on separate threads.
pub fn qsufsort(data: &[u8], concurrency: SortConcurrency) -> Result<Vec<i32>> {
    check_input_size(data.len())?;
    let n = data.len();

    let pool = match concurrency {
        SortConcurrency::Sequential => None,
        SortConcurrency::Parallel(workers) => Some(
            rayon::ThreadPoolBuilder::new()
                .num_threads(workers.max(1))
                .build()
                .map_err(|e| Error::Io(std::io::Error::other(e)))?,
        ),
    };

    let mut buckets = [0i32; 256];
    for &b in data {
        buckets[b as usize] += 1;
    }
    for i in 1..256 {
        buckets[i] += buckets[i - 1];
    }
    for i in (1..256).rev() {
        buckets[i] = buckets[i - 1];
    }
    buckets[0] = 0;

    // I[0] is the empty suffix, which sorts first.
    let mut ia = vec![0i32; n + 1];
    let mut v = vec![0i32; n + 1];
    for (i, &b) in data.iter().enumerate() {
        buckets[b as usize] += 1;
        ia[buckets[b as usize] as usize] = i as i32;
    }
    ia[0] = n as i32;
    for (i, &b) in data.iter().enumerate() {
        v[i] = buckets[b as usize];
    }
    v[n] = 0;
    for i in 1..256 {
        if buckets[i] == buckets[i - 1] + 1 {
            ia[buckets[i] as usize] = -1;
        }
    }
    ia[0] = -1;

    let done = -(n as i32 + 1);
    let mut h = 1usize;
    while ia[0] != done {
        let groups = unsorted_groups(&ia, &v);
        let v2: Vec<AtomicI32> = v.iter().map(|&x| AtomicI32::new(x)).collect();
        {
            let slices = carve(&mut ia, &groups);
            match &pool {
                None => {
                    for (start, group) in slices {
                        split(group, start, &v, &v2, h);
                    }
                }
                Some(pool) => pool.install(|| {
                    slices
                        .into_par_iter()
                        .for_each(|(start, group)| split(group, start, &v, &v2, h));
                }),
            }
        }
        v = v2.into_iter().map(AtomicI32::into_inner).collect();
        merge_sorted_runs(&mut ia, &v);
        h += h;
    }

    for (i, &group) in v.iter().enumerate() {
        ia[group as usize] = i as i32;
    }
    ia.remove(0);
    Ok(ia)
}

/// `(start, len)` of every unsorted group, in order.
fn unsorted_groups(ia: &[i32], v: &[i32]) -> Vec<(usize, usize)> {
    let mut groups = Vec::new();
    let mut i = 0;
    while i < ia.len() {
        if ia[i] < 0 {
            i += (-ia[i]) as usize;
        } else {
            let len = v[ia[i] as usize] as usize + 1 - i;
            groups.push((i, len));
            i += len;
        }
    }
    groups
}

/// Splits `ia` into the disjoint mutable slices named by `groups`.
fn carve<'a>(ia: &'a mut [i32], groups: &[(usize, usize)]) -> Vec<(usize, &'a mut [i32])> {
    let mut out = Vec::with_capacity(groups.len());
    let mut rest = ia;
    let mut consumed = 0;
    for &(start, len) in groups {
        let (_, tail) = std::mem::take(&mut rest).split_at_mut(start - consumed);
        let (group, tail) = tail.split_at_mut(len);
        out.push((start, group));
        rest = tail;
        consumed = start + len;
    }
    out
}

/// Rewrites adjacent sorted runs as one negative length.
fn merge_sorted_runs(ia: &mut [i32], v: &[i32]) {
    let mut run = 0usize;
    let mut i = 0;
    while i < ia.len() {
        if ia[i] < 0 {
            run += (-ia[i]) as usize;
            i += (-ia[i]) as usize;
        } else {
            if run > 0 {
                ia[i - run] = -(run as i32);
            }
            run = 0;
            i = v[ia[i] as usize] as usize + 1;
        }
    }
    if run > 0 {
        ia[i - run] = -(run as i32);
    }
}

/// Ternary split of one group keyed on `v[suffix + h]`. `base` is the
/// position of `group[0]` in the full array.
fn split(group: &mut [i32], base: usize, v: &[i32], v2: &[AtomicI32], h: usize) {
    let len = group.len();
    let key = |suffix: i32| v[suffix as usize + h];
    let assign = |suffix: i32, number: usize| v2[suffix as usize].store(number as i32, Ordering::Relaxed);

    if len < 16 {
        let mut k = 0;
        while k < len {
            let mut j = 1;
            let mut x = key(group[k]);
            for i in 1..len - k {
                let y = key(group[k + i]);
                if y < x {
                    x = y;
                    j = 0;
                }
                if y == x {
                    group.swap(k + j, k + i);
                    j += 1;
                }
            }
            for i in 0..j {
                assign(group[k + i], base + k + j - 1);
            }
            if j == 1 {
                group[k] = -1;
            }
            k += j;
        }
        return;
    }

    let x = key(group[len / 2]);
    let mut jj = 0;
    let mut kk = 0;
    for &suffix in group.iter() {
        let y = key(suffix);
        if y < x {
            jj += 1;
        }
        if y == x {
            kk += 1;
        }
    }
    kk += jj;

    let (mut i, mut j, mut k) = (0, 0, 0);
    while i < jj {
        let y = key(group[i]);
        if y < x {
            i += 1;
        } else if y == x {
            group.swap(i, jj + j);
            j += 1;
        } else {
            group.swap(i, kk + k);
            k += 1;
        }
    }
    while jj + j < kk {
        if key(group[jj + j]) == x {
            j += 1;
        } else {
            group.swap(jj + j, kk + k);
            k += 1;
        }
    }

    if jj > 0 {
        split(&mut group[..jj], base, v, v2, h);
    }
    for &suffix in &group[jj..kk] {
        assign(suffix, base + kk - 1);
    }
    if jj == kk - 1 {
        group[jj] = -1;
    }
    if len > kk {
        split(&mut group[kk..], base + kk, v, v2, h);
    }
}
