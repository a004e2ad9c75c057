/// Object names are 8-digit base-36 counters over `[0-9A-Z]`, read
/// most-significant digit first: a namespace of 36^8 (about 2.8e12) names
/// before the counter comes back around.

pub const OBJECT_NAME_LEN: usize = 8;
const RADIX: u32 = 36;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    NamespaceExhausted,
}
pub type Result<T> = std::result::Result<T, Error>;

/// What `next` does when the counter overflows its most significant
/// digit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wrap around silently. Mirrors the historical token format, whose
    /// overflow pass re-enters the increment loop and lands on
    /// `"00000001"` (it increments past zero before converting back).
    Wrap,
    /// Surface the overflow as `NamespaceExhausted`.
    Fail,
}

/// Compute the name following `current`. A digit outside `[0-9A-Z]` is
/// treated as value 36, i.e. normalized to `0` with a carry into the next
/// digit.
pub fn next(current: &[u8; OBJECT_NAME_LEN], policy: OverflowPolicy) -> Result<[u8; OBJECT_NAME_LEN]> {
    let mut val = [0u32; OBJECT_NAME_LEN];
    for (v, &c) in val.iter_mut().zip(current.iter()) {
        *v = match c {
            b'0'..=b'9' => u32::from(c - b'0'),
            b'A'..=b'Z' => u32::from(c - b'A') + 10,
            _ => RADIX,
        };
    }

    // One full sweep normalizes every digit, so an invalid digit is
    // folded to zero even when the increment's carry never reaches it.
    let mut carry = 1u32;
    for v in val.iter_mut().rev() {
        *v += carry;
        carry = 0;
        if *v >= RADIX {
            *v = 0;
            carry = 1;
        }
    }
    if carry != 0 {
        // Carry out of the most significant digit.
        match policy {
            OverflowPolicy::Fail => return Err(Error::NamespaceExhausted),
            OverflowPolicy::Wrap => val[OBJECT_NAME_LEN - 1] += 1,
        }
    }

    let mut next = [0u8; OBJECT_NAME_LEN];
    for (n, &v) in next.iter_mut().zip(val.iter()) {
        *n = if v < 10 {
            b'0' + v as u8
        } else {
            b'A' + (v - 10) as u8
        };
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> String {
        let mut cur = [0u8; OBJECT_NAME_LEN];
        cur.copy_from_slice(name.as_bytes());
        String::from_utf8(next(&cur, OverflowPolicy::Wrap).unwrap().to_vec()).unwrap()
    }

    #[test]
    fn simple_increment() {
        assert_eq!(step("00000000"), "00000001");
        assert_eq!(step("00000009"), "0000000A");
        assert_eq!(step("0000000Z"), "00000010");
    }

    #[test]
    fn carry_propagates() {
        assert_eq!(step("0000ZZZZ"), "00010000");
        assert_eq!(step("0A2BZZZZ"), "0A2C0000");
    }

    #[test]
    fn invalid_digit_normalizes_with_carry() {
        // '?' is out of range: treated as 36, so it zeroes and carries.
        assert_eq!(step("0000000?"), "00000010");
        assert_eq!(step("000000?5"), "00000106");
    }

    #[test]
    fn wraparound_policy() {
        assert_eq!(step("ZZZZZZZZ"), "00000001");
    }

    #[test]
    fn exhaustion_policy() {
        let cur = *b"ZZZZZZZZ";
        assert_eq!(
            next(&cur, OverflowPolicy::Fail).unwrap_err(),
            Error::NamespaceExhausted
        );
    }

    #[test]
    fn monotone_over_a_window() {
        let mut cur = *b"00000ZZY";
        let mut prev = cur;
        for _ in 0..100 {
            cur = next(&cur, OverflowPolicy::Fail).unwrap();
            assert_ne!(cur, prev);
            prev = cur;
        }
        // "00000ZZY" is 46654 in base 36; 100 steps later is 46754.
        assert_eq!(&cur, b"0000102Q");
    }
}
