/// Suffix array by the skew (difference cover 3) construction. Linear time,
/// used for small inputs and as a cross-check for [`qsufsort`](super::qsufsort).
pub fn dc3(data: &[u8]) -> Vec<i32> {
    match data.len() {
        0 => return Vec::new(),
        1 => return vec![0],
        _ => {}
    }
    // Shift the alphabet to 1..=256 so 0 can pad the tail.
    let mut s: Vec<usize> = data.iter().map(|&b| b as usize + 1).collect();
    s.extend_from_slice(&[0, 0, 0]);
    let mut sa = vec![0usize; data.len()];
    skew(&s, &mut sa, data.len(), 256);
    sa.into_iter().map(|i| i as i32).collect()
}

fn leq2(a1: usize, a2: usize, b1: usize, b2: usize) -> bool {
    a1 < b1 || (a1 == b1 && a2 <= b2)
}

fn leq3(a1: usize, a2: usize, a3: usize, b1: usize, b2: usize, b3: usize) -> bool {
    a1 < b1 || (a1 == b1 && leq2(a2, a3, b2, b3))
}

/// Stable counting sort of `a` into `b` keyed on `r[x + offset]`.
fn radix_pass(a: &[usize], b: &mut [usize], r: &[usize], offset: usize, alphabet: usize) {
    let mut count = vec![0usize; alphabet + 1];
    for &x in a {
        count[r[x + offset]] += 1;
    }
    let mut sum = 0;
    for c in count.iter_mut() {
        let t = *c;
        *c = sum;
        sum += t;
    }
    for &x in a {
        let key = r[x + offset];
        b[count[key]] = x;
        count[key] += 1;
    }
}

/// `s` holds `n` symbols in `1..=alphabet` followed by three zeros.
fn skew(s: &[usize], sa: &mut [usize], n: usize, alphabet: usize) {
    let n0 = n.div_ceil(3);
    let n1 = (n + 1) / 3;
    let n2 = n / 3;
    let n02 = n0 + n2;

    let mut s12 = vec![0usize; n02 + 3];
    let mut sa12 = vec![0usize; n02 + 3];
    let mut s0 = vec![0usize; n0];
    let mut sa0 = vec![0usize; n0];

    // Positions i mod 3 != 0, plus a dummy when n mod 3 == 1.
    let mut j = 0;
    for i in 0..n + (n0 - n1) {
        if i % 3 != 0 {
            s12[j] = i;
            j += 1;
        }
    }

    radix_pass(&s12[..n02], &mut sa12[..n02], s, 2, alphabet);
    radix_pass(&sa12[..n02], &mut s12[..n02], s, 1, alphabet);
    radix_pass(&s12[..n02], &mut sa12[..n02], s, 0, alphabet);

    // Name the triples.
    let mut name = 0;
    let (mut c0, mut c1, mut c2) = (usize::MAX, usize::MAX, usize::MAX);
    for &p in &sa12[..n02] {
        if s[p] != c0 || s[p + 1] != c1 || s[p + 2] != c2 {
            name += 1;
            (c0, c1, c2) = (s[p], s[p + 1], s[p + 2]);
        }
        if p % 3 == 1 {
            s12[p / 3] = name;
        } else {
            s12[p / 3 + n0] = name;
        }
    }

    if name < n02 {
        skew(&s12, &mut sa12, n02, name);
        for i in 0..n02 {
            s12[sa12[i]] = i + 1;
        }
    } else {
        for i in 0..n02 {
            sa12[s12[i] - 1] = i;
        }
    }

    let mut j = 0;
    for &p in &sa12[..n02] {
        if p < n0 {
            s0[j] = 3 * p;
            j += 1;
        }
    }
    radix_pass(&s0, &mut sa0, s, 0, alphabet);

    let position = |t: usize| {
        if sa12[t] < n0 {
            sa12[t] * 3 + 1
        } else {
            (sa12[t] - n0) * 3 + 2
        }
    };

    let mut p = 0;
    let mut t = n0 - n1;
    let mut k = 0;
    while k < n {
        let i = position(t);
        let j = sa0[p];
        let twelve_first = if sa12[t] < n0 {
            leq2(s[i], s12[sa12[t] + n0], s[j], s12[j / 3])
        } else {
            leq3(
                s[i],
                s[i + 1],
                s12[sa12[t] - n0 + 1],
                s[j],
                s[j + 1],
                s12[j / 3 + n0],
            )
        };

        if twelve_first {
            sa[k] = i;
            t += 1;
            if t == n02 {
                k += 1;
                while p < n0 {
                    sa[k] = sa0[p];
                    p += 1;
                    k += 1;
                }
            }
        } else {
            sa[k] = j;
            p += 1;
            if p == n0 {
                k += 1;
                while t < n02 {
                    sa[k] = position(t);
                    t += 1;
                    k += 1;
                }
            }
        }
        k += 1;
    }
}
