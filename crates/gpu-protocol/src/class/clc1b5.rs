//! Pascal-B copy engine: split origin methods replacing the packed
//! `SET_{SRC,DST}_ORIGIN` of older engines.

pub const SRC_ORIGIN_X: u32 = 0x0744;
pub const SRC_ORIGIN_Y: u32 = 0x0748;
pub const DST_ORIGIN_X: u32 = 0x074c;
pub const DST_ORIGIN_Y: u32 = 0x0750;
