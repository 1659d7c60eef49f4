/// Adler-style rolling hash for block matching.
///
/// Two 16-bit sums over a window of `L` bytes: `a = Σ x[i]` and
/// `b = Σ (L - i) · x[i]`, both mod 2^16, combined as `a + 2^16 · b`.
/// Sliding the window by one byte is O(1).
const MOD_MASK: u32 = 0xFFFF;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollingHash {
    a: u32,
    b: u32,
    window_size: u32,
}

impl RollingHash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash of `data` computed from scratch.
    pub fn of(data: &[u8]) -> Self {
        let mut h = Self::new();
        h.init(data);
        h
    }

    /// Compute hash over an initial block of data.
    pub fn init(&mut self, data: &[u8]) {
        self.window_size = data.len() as u32;
        let len = data.len() as u32;
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        for (i, &byte) in data.iter().enumerate() {
            a = a.wrapping_add(u32::from(byte));
            b = b.wrapping_add((len - i as u32).wrapping_mul(u32::from(byte)));
        }
        self.a = a & MOD_MASK;
        self.b = b & MOD_MASK;
    }

    /// Slide the window: remove `old_byte` from front, add `new_byte` at back.
    pub fn rotate(&mut self, old_byte: u8, new_byte: u8) {
        let old = u32::from(old_byte);
        let new = u32::from(new_byte);

        self.a = self.a.wrapping_sub(old).wrapping_add(new) & MOD_MASK;
        self.b = self
            .b
            .wrapping_sub(self.window_size.wrapping_mul(old))
            .wrapping_add(self.a)
            & MOD_MASK;
    }

    /// Shrink the window: remove `old_byte` from the front without adding.
    /// The remaining bytes keep their weights.
    pub fn rollout(&mut self, old_byte: u8) {
        let old = u32::from(old_byte);
        self.a = self.a.wrapping_sub(old) & MOD_MASK;
        self.b = self
            .b
            .wrapping_sub(self.window_size.wrapping_mul(old))
            & MOD_MASK;
        self.window_size -= 1;
    }

    pub fn window_size(&self) -> usize {
        self.window_size as usize
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_init_deterministic() {
        let data = b"Hello, World!";
        assert_eq!(RollingHash::of(data).digest(), RollingHash::of(data).digest());
    }

    #[test]
    fn test_different_data_different_hash() {
        assert_ne!(
            RollingHash::of(b"Hello").digest(),
            RollingHash::of(b"World").digest()
        );
    }

    #[test]
    fn test_known_value() {
        // a = 1 + 2 + 3 = 6, b = 3·1 + 2·2 + 1·3 = 10
        assert_eq!(RollingHash::of(&[1, 2, 3]).digest(), (10 << 16) | 6);
        assert_eq!(RollingHash::of(&[]).digest(), 0);
    }

    #[test]
    fn test_rotate_equals_fresh_init() {
        let data = b"ABCDE";
        let mut rolling = RollingHash::of(&data[0..4]);
        rolling.rotate(data[0], data[4]);
        assert_eq!(rolling.digest(), RollingHash::of(&data[1..5]).digest());
    }

    #[test]
    fn test_rollout_equals_fresh_init() {
        let data = b"rolling out";
        let mut rolling = RollingHash::of(data);
        for start in 1..data.len() {
            rolling.rollout(data[start - 1]);
            assert_eq!(rolling.digest(), RollingHash::of(&data[start..]).digest());
            assert_eq!(rolling.window_size(), data.len() - start);
        }
    }

    proptest! {
        #[test]
        fn rolling_matches_recompute_on_every_window(
            data in prop::collection::vec(any::<u8>(), 2..2048),
            window in 1usize..512,
        ) {
            let window = window.min(data.len() - 1);
            let mut rolling = RollingHash::of(&data[..window]);
            for start in 1..=data.len() - window {
                rolling.rotate(data[start - 1], data[start + window - 1]);
                prop_assert_eq!(
                    rolling.digest(),
                    RollingHash::of(&data[start..start + window]).digest()
                );
            }
        }
    }
}
