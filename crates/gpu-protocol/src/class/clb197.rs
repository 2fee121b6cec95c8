//! Maxwell-B 3D additions.

/// Post-depth-coverage input mask for the pixel shader.
pub const SET_POST_Z_PS_IMASK: u32 = 0x166c;
