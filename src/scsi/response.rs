//! Representations for responses to SCSI commands.

use color_eyre::eyre::ensure;

pub type ResponseParser = fn(&[u8]) -> color_eyre::Result<Response>;

pub enum Response {
    Inquiry(Inquiry),
    ReadCapacity(ReadCapacity),

    None,
}

pub fn no_response(buf: &[u8]) -> color_eyre::Result<Response> {
    ensure!(buf.is_empty(), "unexpected response data");
    Ok(Response::None)
}

pub fn inquiry_response(buf: &[u8]) -> color_eyre::Result<Response> {
    ensure!(
        buf.len() == std::mem::size_of::<Inquiry>(),
        "provided slice length does not match struct size"
    );
    // SAFETY: it's been validated that the slice size matches the struct size,
    // and the struct is packed so any alignment will do
    let s: &'_ Inquiry = unsafe { &*(buf.as_ptr() as *const Inquiry) };
    Ok(Response::Inquiry(*s))
}

pub fn read_capacity_response(buf: &[u8]) -> color_eyre::Result<Response> {
    ensure!(
        buf.len() == 8,
        "READ CAPACITY (10) data must be 8 bytes, was {}",
        buf.len()
    );
    let last_lba = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let block_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok(Response::ReadCapacity(ReadCapacity {
        last_lba,
        block_len,
    }))
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct Inquiry {
    /// Contains both the PERIPHERAL QUALIFIER (bits 7:5) and PERIPHERAL DEVICE TYPE (bits 4:0)
    /// fields.
    ///
    /// The PERIPHERAL QUALIFIER field describes the current state
    /// of the device. Zero means the device type is currently connected,
    /// which does not mean the device is ready for access.
    ///
    /// The PERIPHERAL DEVICE TYPE should be 0h0 because a USB flash drive
    /// is a direct access device. (see table 48)
    pub peripheral_info: u8,
    /// Fields that are not needed
    _unparsed: [u8; 35],
}

impl Inquiry {
    /// True for a connected direct access block device.
    pub fn is_direct_access(&self) -> bool {
        self.peripheral_info == 0
    }
}

/// READ CAPACITY (10) parameter data, SBC-2 table 30.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReadCapacity {
    /// "the logical block address of the last logical block"
    pub last_lba: u32,
    /// "the number of bytes of user data in the logical block"
    pub block_len: u32,
}

impl ReadCapacity {
    /// Number of blocks on the unit.
    ///
    /// A last LBA of `0xFFFF_FFFF` means the unit is too large for this
    /// command; it maps to `u32::MAX`, the "no real device" sentinel.
    pub fn block_count(&self) -> u32 {
        self.last_lba.checked_add(1).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::{Response, read_capacity_response};

    #[test]
    fn read_capacity_counts_blocks() {
        let data = [0x00, 0x00, 0x07, 0xff, 0x00, 0x00, 0x02, 0x00];
        let Ok(Response::ReadCapacity(capacity)) = read_capacity_response(&data) else {
            panic!("should parse read capacity data");
        };
        assert_eq!(capacity.block_count(), 2048);
        assert_eq!(capacity.block_len, 512);
    }

    #[test]
    fn oversized_unit_maps_to_sentinel() {
        let data = [0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x02, 0x00];
        let Ok(Response::ReadCapacity(capacity)) = read_capacity_response(&data) else {
            panic!("should parse read capacity data");
        };
        assert_eq!(capacity.block_count(), u32::MAX);
    }

    #[test]
    fn catch_short_capacity_data() {
        let Err(e) = read_capacity_response(&[0; 4]) else {
            panic!("should reject short data");
        };
        assert!(e.root_cause().to_string().contains("8 bytes"));
    }
}
