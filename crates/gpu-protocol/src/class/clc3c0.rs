//! Volta compute additions: 64-bit shared/local memory windows.

pub const SET_SHADER_SHARED_MEMORY_WINDOW_A: u32 = 0x02a0;
pub const SET_SHADER_SHARED_MEMORY_WINDOW_B: u32 = 0x02a4;
pub const SET_SHADER_LOCAL_MEMORY_WINDOW_A: u32 = 0x07b0;
pub const SET_SHADER_LOCAL_MEMORY_WINDOW_B: u32 = 0x07b4;
