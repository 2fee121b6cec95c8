//! Volta 3D additions: 64-bit program addresses per pipeline slot.

pub const fn set_pipeline_program_address_a(index: u32) -> u32 {
    0x2004 + index * 0x40
}

pub const fn set_pipeline_program_address_b(index: u32) -> u32 {
    0x2008 + index * 0x40
}
