//! PM4 type-3 packets used by the prim-cull graphics and compute streams.

/// Type-3 packet header. `count` is the number of payload dwords minus one.
#[inline]
pub const fn pkt3(op: u32, count: u32, predicate: bool) -> u32 {
    (3 << 30) | ((count & 0x3fff) << 16) | ((op & 0xff) << 8) | (predicate as u32)
}

pub const fn pkt3_opcode(hdr: u32) -> u32 {
    (hdr >> 8) & 0xff
}

/// Payload dwords following a type-3 header.
pub const fn pkt3_payload_len(hdr: u32) -> u32 {
    ((hdr >> 16) & 0x3fff) + 1
}

pub const fn pkt_type(hdr: u32) -> u32 {
    hdr >> 30
}

pub const PKT3_NOP: u32 = 0x10;
pub const PKT3_DISPATCH_DIRECT: u32 = 0x15;
pub const PKT3_DRAW_INDEX_2: u32 = 0x27;
pub const PKT3_RELEASE_MEM: u32 = 0x49;
pub const PKT3_ACQUIRE_MEM: u32 = 0x58;
pub const PKT3_REWIND: u32 = 0x59;
pub const PKT3_SET_SH_REG: u32 = 0x76;

pub const SI_SH_REG_OFFSET: u32 = 0xb000;
pub const R_00B810_COMPUTE_START_X: u32 = 0xb810;
pub const R_00B81C_COMPUTE_NUM_THREAD_X: u32 = 0xb81c;
pub const R_00B900_COMPUTE_USER_DATA_0: u32 = 0xb900;

pub const fn s_00b81c_num_thread_full(x: u32) -> u32 {
    x & 0xffff
}

pub const fn s_00b81c_num_thread_partial(x: u32) -> u32 {
    (x & 0xffff) << 16
}

/// `DISPATCH_DIRECT` initiator bits.
pub const COMPUTE_SHADER_EN: u32 = 1 << 0;
pub const PARTIAL_TG_EN: u32 = 1 << 1;
pub const ORDER_MODE: u32 = 1 << 3;

/// Draw initiator: indices come from memory.
pub const V_0287F0_DI_SRC_SEL_DMA: u32 = 0;

pub const fn release_mem_event_type(x: u32) -> u32 {
    x & 0x3f
}

pub const fn release_mem_event_index(x: u32) -> u32 {
    (x & 0xf) << 8
}

/// `DATA_SEL` value writing the low 32 bits of the data field.
pub const RELEASE_MEM_DATA_SEL_VALUE_32BIT: u32 = 1;

pub const fn release_mem_data_sel(x: u32) -> u32 {
    (x & 0x7) << 29
}

/// `EVENT_INDEX` for end-of-pipe events.
pub const EVENT_INDEX_EOP: u32 = 5;

/// End-of-compute event used as the cross-queue release.
pub const V_028A90_CS_DONE: u32 = 0x2f;

/// Value the REWIND packet waits for.
pub const REWIND_SIGNAL_VALUE: u32 = 0x8000_0000;

/// `REWIND` payload bit telling the CP the packet is valid.
pub const REWIND_VALID: u32 = 1 << 31;

/// Dword offset of a SH register relative to the SET_SH_REG window.
pub const fn sh_reg_index(reg: u32) -> u32 {
    (reg - SI_SH_REG_OFFSET) >> 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        let hdr = pkt3(PKT3_SET_SH_REG, 3, false);
        assert_eq!(hdr, 0xc003_7600);
        assert_eq!(pkt_type(hdr), 3);
        assert_eq!(pkt3_opcode(hdr), PKT3_SET_SH_REG);
        assert_eq!(pkt3_payload_len(hdr), 4);
        assert_eq!(pkt3(PKT3_NOP, 0, true) & 1, 1);
        assert_eq!(sh_reg_index(R_00B900_COMPUTE_USER_DATA_0), 0x240);
        assert_eq!(sh_reg_index(R_00B81C_COMPUTE_NUM_THREAD_X), 0x207);
        assert_eq!(
            s_00b81c_num_thread_full(256) | s_00b81c_num_thread_partial(17),
            0x0011_0100
        );
        assert_eq!(release_mem_event_index(EVENT_INDEX_EOP), 0x500);
        assert_eq!(release_mem_data_sel(1), 0x2000_0000);
    }
}
