//! Per-generation emitters, bound once from the channel's class ids.

use gpu_protocol::class::{
    cl90b5, cla0c0, clc1b5, clc3c0, ClassSet, KEPLER_COMPUTE_A, MAXWELL_B, PASCAL_DMA_COPY_B,
    VOLTA_COMPUTE_A,
};
use gpu_protocol::push::{SUBC_COMPUTE, SUBC_COPY};

use crate::push::PushBuilder;

/// Start of the shader local memory window.
pub const LOCAL_MEMORY_WINDOW: u64 = 0xff << 24;
/// Start of the shader shared memory window.
pub const SHARED_MEMORY_WINDOW: u64 = 0xfe << 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopySide {
    Src,
    Dst,
}

/// Hardware differences the emitters care about.
#[derive(Debug)]
pub struct GenOps {
    pub name: &'static str,
    /// Emits the tiled-side origin of a copy, `x` in bytes.
    pub emit_copy_origin: fn(&mut PushBuilder, CopySide, u32, u32),
    /// Emits the compute shared/local memory windows.
    pub emit_memory_windows: fn(&mut PushBuilder),
    pub has_post_z_ps_imask: bool,
    /// Pre-Volta compute wants throttled SLM limits too.
    pub has_throttled_slm: bool,
    /// Compute TLS is sized per command buffer.
    pub has_compute_tls: bool,
}

fn copy_origin_packed(p: &mut PushBuilder, side: CopySide, x: u32, y: u32) {
    let mthd = match side {
        CopySide::Src => cl90b5::SET_SRC_ORIGIN,
        CopySide::Dst => cl90b5::SET_DST_ORIGIN,
    };
    p.mthd(SUBC_COPY, mthd).inline_data(cl90b5::origin(x, y));
}

fn copy_origin_split(p: &mut PushBuilder, side: CopySide, x: u32, y: u32) {
    let mthd = match side {
        CopySide::Src => clc1b5::SRC_ORIGIN_X,
        CopySide::Dst => clc1b5::DST_ORIGIN_X,
    };
    p.mthd(SUBC_COPY, mthd).inline_data(x).inline_data(y);
}

fn memory_windows_fermi(p: &mut PushBuilder) {
    p.mthd(SUBC_COMPUTE, cla0c0::SET_SHADER_LOCAL_MEMORY_WINDOW)
        .inline_data(LOCAL_MEMORY_WINDOW as u32);
    p.mthd(SUBC_COMPUTE, cla0c0::SET_SHADER_SHARED_MEMORY_WINDOW)
        .inline_data(SHARED_MEMORY_WINDOW as u32);
}

fn memory_windows_volta(p: &mut PushBuilder) {
    p.mthd(SUBC_COMPUTE, clc3c0::SET_SHADER_SHARED_MEMORY_WINDOW_A)
        .inline_addr(SHARED_MEMORY_WINDOW);
    p.mthd(SUBC_COMPUTE, clc3c0::SET_SHADER_LOCAL_MEMORY_WINDOW_A)
        .inline_addr(LOCAL_MEMORY_WINDOW);
}

impl GenOps {
    pub fn for_classes(classes: &ClassSet) -> GenOps {
        let volta = classes.compute >= VOLTA_COMPUTE_A;
        GenOps {
            name: if volta {
                "volta"
            } else if classes.compute >= KEPLER_COMPUTE_A {
                "kepler"
            } else {
                "fermi"
            },
            emit_copy_origin: if classes.copy >= PASCAL_DMA_COPY_B {
                copy_origin_split
            } else {
                copy_origin_packed
            },
            emit_memory_windows: if volta {
                memory_windows_volta
            } else {
                memory_windows_fermi
            },
            has_post_z_ps_imask: classes.eng3d >= MAXWELL_B,
            has_throttled_slm: !volta,
            has_compute_tls: classes.compute >= KEPLER_COMPUTE_A,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_protocol::push::{decode, MethodWrite};
    use pretty_assertions::assert_eq;

    #[test]
    fn turing_uses_split_origin_and_volta_windows() {
        let ops = GenOps::for_classes(&ClassSet::TURING);
        assert!(ops.has_post_z_ps_imask);
        assert!(!ops.has_throttled_slm);

        let mut p = PushBuilder::new();
        (ops.emit_copy_origin)(&mut p, CopySide::Dst, 64, 3);
        assert_eq!(
            decode(p.dwords()).unwrap(),
            vec![
                MethodWrite::new(SUBC_COPY, clc1b5::DST_ORIGIN_X, 64),
                MethodWrite::new(SUBC_COPY, clc1b5::DST_ORIGIN_Y, 3),
            ]
        );

        let mut p = PushBuilder::new();
        (ops.emit_memory_windows)(&mut p);
        let writes = decode(p.dwords()).unwrap();
        assert_eq!(writes[1].data, 0xfe00_0000);
        assert_eq!(writes[3].data, 0xff00_0000);
    }

    #[test]
    fn kepler_uses_packed_origin() {
        let ops = GenOps::for_classes(&ClassSet::KEPLER);
        assert!(ops.has_throttled_slm);
        assert!(ops.has_compute_tls);
        let mut p = PushBuilder::new();
        (ops.emit_copy_origin)(&mut p, CopySide::Src, 16, 2);
        assert_eq!(
            decode(p.dwords()).unwrap(),
            vec![MethodWrite::new(SUBC_COPY, cl90b5::SET_SRC_ORIGIN, 0x0002_0010)]
        );
    }
}
