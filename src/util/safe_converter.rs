//! Conversions between in-memory lengths (`usize`) and the u32 length prefixes and counts that
//!  go over the wire.

/// Widening conversions that can not fail on any platform this crate builds for
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}


/// For narrowing casts where the caller checked the range before, e.g. a message's size against
///  [crate::config::TcpConfig::max_message_size] which `validate()` limits to u32.
///
/// NB: The implementations panic if the value is out of range, since that is a bug
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        u32::try_from(self).expect("this is a bug: the length should have been checked before")
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case(0)]
    #[case(1234)]
    #[case(u32::MAX)]
    fn test_length_round_trip(#[case] len: u32) {
        let as_usize: usize = len.safe_cast();
        let back: u32 = as_usize.prechecked_cast();
        assert_eq!(back, len);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    #[should_panic]
    fn test_prechecked_cast_out_of_range() {
        let too_long = u32::MAX as usize + 1;
        let _: u32 = too_long.prechecked_cast();
    }
}
