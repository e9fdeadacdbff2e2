///The accelerator's DMA engine is very specific about argument table alignment.
///
///Every non-empty argument partition is padded with a small slack, so that the final
///descriptor fetch of the partition never crosses into the next one, and is then rounded
///up to the descriptor alignment.
///
///Fixed-address buffers are placed at the coarser memory alignment used by the
///allocator for tensor memory.

///The `Align` trait provides methods to calculate the alignment of a u64, and to align a u64
pub trait Align {
    const ARGS_SLACK: u64 = 32;
    const ARGS_ALIGNMENT: u64 = 64;
    const MEMORY_ALIGNMENT: u64 = 512;

    fn calculate_alignment(&self, alignment: u64) -> u64;
    fn align_to(&self, alignment: u64) -> Option<u64>;
    fn align_for_args(&self) -> Option<u64>;
    fn align_for_memory(&self) -> Option<u64>;
}

impl Align for u64 {
    fn calculate_alignment(&self, alignment: u64) -> u64 {
        let remainder = self % alignment;
        if remainder == 0 {
            0
        } else {
            alignment - remainder
        }
    }

    fn align_to(&self, alignment: u64) -> Option<u64> {
        self.checked_add(self.calculate_alignment(alignment))
    }

    /// Slack first, then round up. An empty partition stays empty.
    fn align_for_args(&self) -> Option<u64> {
        if *self == 0 {
            return Some(0);
        }
        self.checked_add(Self::ARGS_SLACK)?
            .align_to(Self::ARGS_ALIGNMENT)
    }

    fn align_for_memory(&self) -> Option<u64> {
        self.align_to(Self::MEMORY_ALIGNMENT)
    }
}

/// Divide a number by the indicated dividend, then round up to the next multiple of the dividend if there is a rest.
pub fn div_ceil(num: u64, div: u64) -> u64 {
    num / div + (num % div != 0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::proptest;

    #[test]
    fn args_alignment_adds_slack() {
        assert_eq!(0u64.align_for_args(), Some(0));
        assert_eq!(24u64.align_for_args(), Some(64));
        assert_eq!(32u64.align_for_args(), Some(64));
        assert_eq!(33u64.align_for_args(), Some(128));
        assert_eq!(96u64.align_for_args(), Some(128));
    }

    #[test]
    fn alignment_overflow_is_reported() {
        assert_eq!((u64::MAX - 8).align_for_args(), None);
        assert_eq!((u64::MAX - 8).align_for_memory(), None);
    }

    #[proptest(cases = 256)]
    fn aligned_args_are_padded(#[strategy(1u64..1 << 40)] len: u64) {
        let aligned = len.align_for_args().unwrap();
        assert_eq!(aligned % u64::ARGS_ALIGNMENT, 0);
        assert!(aligned >= len + u64::ARGS_SLACK);
        assert!(aligned - len - u64::ARGS_SLACK < u64::ARGS_ALIGNMENT);
    }
}
