use gpu_protocol::push::{
    decode, immd_header, mthd_header, ninc_header, MethodWrite, IMMD_LIMIT, SUBC_2D, SUBC_3D,
    SUBC_COMPUTE, SUBC_COPY,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Packet {
    Inc { subc: u8, mthd: u32, data: Vec<u32> },
    NonInc { subc: u8, mthd: u32, data: Vec<u32> },
    Immd { subc: u8, mthd: u32, value: u32 },
}

fn subc_strategy() -> impl Strategy<Value = u8> {
    prop_oneof![
        Just(SUBC_3D),
        Just(SUBC_COMPUTE),
        Just(SUBC_2D),
        Just(SUBC_COPY)
    ]
}

fn packet_strategy() -> impl Strategy<Value = Packet> {
    let mthd = (0u32..0x1000).prop_map(|m| m << 2);
    prop_oneof![
        (subc_strategy(), mthd.clone(), prop::collection::vec(any::<u32>(), 1..16))
            .prop_map(|(subc, mthd, data)| Packet::Inc { subc, mthd, data }),
        (subc_strategy(), mthd.clone(), prop::collection::vec(any::<u32>(), 1..16))
            .prop_map(|(subc, mthd, data)| Packet::NonInc { subc, mthd, data }),
        (subc_strategy(), mthd, 0u32..IMMD_LIMIT)
            .prop_map(|(subc, mthd, value)| Packet::Immd { subc, mthd, value }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]
    #[test]
    fn decoded_writes_match_encoded_packets(packets in prop::collection::vec(packet_strategy(), 0..24)) {
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for p in &packets {
            match p {
                Packet::Inc { subc, mthd, data } => {
                    stream.push(mthd_header(*subc, *mthd, data.len() as u32));
                    for (i, d) in data.iter().enumerate() {
                        expected.push(MethodWrite::new(*subc, mthd + 4 * i as u32, *d));
                    }
                    stream.extend_from_slice(data);
                }
                Packet::NonInc { subc, mthd, data } => {
                    stream.push(ninc_header(*subc, *mthd, data.len() as u32));
                    expected.extend(data.iter().map(|d| MethodWrite::new(*subc, *mthd, *d)));
                    stream.extend_from_slice(data);
                }
                Packet::Immd { subc, mthd, value } => {
                    stream.push(immd_header(*subc, *mthd, *value));
                    expected.push(MethodWrite::new(*subc, *mthd, *value));
                }
            }
        }
        prop_assert_eq!(decode(&stream).unwrap(), expected);
    }
}
