use gpu_submit::prim_cull::udiv::{packed_terms, unpack_terms};
use gpu_submit::prim_cull::FastUdivInfo;
use proptest::prelude::*;

fn numerator() -> impl Strategy<Value = u32> {
    prop_oneof![
        any::<u32>(),
        Just(0u32),
        Just(u32::MAX),
        Just(u32::MAX - 1),
        Just((1u32 << 31) - 1),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 1024,
        .. ProptestConfig::default()
    })]

    #[test]
    fn eval_matches_division(d in 1u32.., n in numerator()) {
        let info = FastUdivInfo::new(d, 32);
        prop_assert_eq!(info.eval(n), n / d);
    }

    #[test]
    fn nuw_form_is_exact_where_safe(d in 1u32.., n in numerator()) {
        let info = FastUdivInfo::new(d, 32);
        if info.nuw_safe(n) {
            prop_assert_eq!(info.eval_nuw(n), n / d);
        }
    }

    #[test]
    fn kernel_form_for_31_bit_ids(d in 2u32..(1 << 27), n in 0u32..(1 << 31)) {
        let info = FastUdivInfo::new(d, 31);
        prop_assert_eq!(info.pre_shift, 0);
        prop_assert_eq!(info.increment, 0);
        let terms = packed_terms(info.post_shift, d);
        let (post_shift, prims_per_instance) = unpack_terms(terms);
        prop_assert_eq!(prims_per_instance, d);
        prop_assert_eq!(
            FastUdivInfo::eval_u31_d_not_one(info.multiplier, post_shift, n),
            n / d
        );
    }
}

#[test]
fn max_instance_id_needs_the_wide_path() {
    let info = FastUdivInfo::new(u32::MAX, 32);
    assert_eq!(info.eval(u32::MAX), 1);
    let info = FastUdivInfo::new(3, 32);
    assert_eq!(info.eval(u32::MAX), u32::MAX / 3);
    if !info.nuw_safe(u32::MAX) {
        assert_ne!(info.eval_nuw(u32::MAX), u32::MAX / 3);
    }
}
