//! High-level checks on a freshly attached unit, so that a weirdly configured
//! device cannot bomb the rest of the stack, accidentally or otherwise.

use super::{UnitDescriptor, UnitError};
use crate::error::Rejection;

/// The only block size served. Block address arithmetic everywhere else
/// assumes it.
pub const SUPPORTED_BLOCK_SIZE: u32 = 512;

/// Decides whether `unit` may be exposed over the link.
pub fn approve(unit: &UnitDescriptor) -> Result<(), Rejection> {
    if unit.error != UnitError::Ok {
        return Err(Rejection::UnitError(unit.error));
    }
    if unit.block_count == 0 || unit.block_count == u32::MAX {
        return Err(Rejection::NoMedium(unit.block_count));
    }
    if unit.block_size != SUPPORTED_BLOCK_SIZE {
        return Err(Rejection::UnsupportedBlockSize(unit.block_size));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{SUPPORTED_BLOCK_SIZE, approve};
    use crate::downstream::{UnitDescriptor, UnitError};
    use crate::error::Rejection;

    fn unit(block_count: u32, block_size: u32, error: UnitError) -> UnitDescriptor {
        UnitDescriptor {
            block_count,
            block_size,
            error,
        }
    }

    #[test]
    fn accepts_plain_512_byte_unit() {
        assert_eq!(approve(&unit(1000, SUPPORTED_BLOCK_SIZE, UnitError::Ok)), Ok(()));
    }

    #[test]
    fn rejects_unit_in_error_state() {
        assert_eq!(
            approve(&unit(1000, 512, UnitError::NotReady)),
            Err(Rejection::UnitError(UnitError::NotReady))
        );
    }

    #[test]
    fn rejects_empty_and_sentinel_block_counts() {
        assert_eq!(
            approve(&unit(0, 512, UnitError::Ok)),
            Err(Rejection::NoMedium(0))
        );
        assert_eq!(
            approve(&unit(u32::MAX, 512, UnitError::Ok)),
            Err(Rejection::NoMedium(u32::MAX))
        );
    }

    #[test]
    fn rejects_other_block_sizes() {
        for size in [256, 1024, 2048, 4096] {
            assert_eq!(
                approve(&unit(1000, size, UnitError::Ok)),
                Err(Rejection::UnsupportedBlockSize(size))
            );
        }
    }
}
