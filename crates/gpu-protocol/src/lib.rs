//! Wire-level vocabulary shared by the submission core.
//!
//! This crate has no policy and owns no memory. It describes:
//! - hardware class ids and the method offsets/field packers of each class
//!   ([`class`]);
//! - the pushbuffer header format used to encode method writes ([`push`]);
//! - the compute queue-metadata-descriptor layout ([`qmd`]);
//! - PM4 packet headers used by the prim-cull graphics/compute streams ([`pm4`]);
//! - the abstract kernel submit records ([`uapi`]).

pub mod class;
pub mod pm4;
pub mod push;
pub mod qmd;
pub mod uapi;

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// 32-bit variant of [`align_up`].
#[inline]
pub const fn align_up_u32(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub const GPU_VA_BITS: u32 = 48;

/// Raw 48-bit form of a GPU address. Methods and descriptors never take the
/// sign-extended (canonical) form.
#[inline]
pub const fn gpu_va(addr: u64) -> u64 {
    addr & ((1 << GPU_VA_BITS) - 1)
}

/// Split a GPU address into the `(upper, lower)` dwords most methods take.
#[inline]
pub const fn split_addr(addr: u64) -> (u32, u32) {
    let addr = gpu_va(addr);
    ((addr >> 32) as u32, (addr & 0xffff_ffff) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up_u32(17, 16), 32);
        assert_eq!(split_addr(0x1234_5678_9abc), (0x1234, 0x5678_9abc));
        assert_eq!(split_addr(0xffff_ffff_fff0_1000), (0xffff, 0xfff0_1000));
        assert_eq!(gpu_va(0xffff_8000_0000_0000), 0x8000_0000_0000);
    }
}
