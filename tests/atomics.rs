//! Fetching and non-fetching atomics across the supported widths.

mod common;

use common::runtime;
use fam_runtime::{DataItemDescriptor, Fam, FamErrorKind};

fn item(fam: &Fam, tag: &str) -> DataItemDescriptor {
    let region = fam.create_region(tag, 1 << 20, 0o777, None).unwrap();
    fam.allocate("cells", 4096, 0o600, &region).unwrap()
}

#[test]
fn set_then_fetch_for_all_widths() {
    let fam = runtime(1, "at_widths");
    let item = item(&fam, "widths");

    fam.atomic_set::<i32>(&item, 0, -123).unwrap();
    assert_eq!(fam.atomic_fetch::<i32>(&item, 0).unwrap(), -123);

    fam.atomic_set::<i64>(&item, 8, -1_000_000_000_000).unwrap();
    assert_eq!(
        fam.atomic_fetch::<i64>(&item, 8).unwrap(),
        -1_000_000_000_000
    );

    fam.atomic_set::<u32>(&item, 16, 0xdead_beef).unwrap();
    assert_eq!(fam.atomic_fetch::<u32>(&item, 16).unwrap(), 0xdead_beef);

    fam.atomic_set::<u64>(&item, 24, u64::MAX - 5).unwrap();
    assert_eq!(fam.atomic_fetch::<u64>(&item, 24).unwrap(), u64::MAX - 5);

    fam.atomic_set::<f32>(&item, 32, 2.5).unwrap();
    assert_eq!(fam.atomic_fetch::<f32>(&item, 32).unwrap(), 2.5);

    fam.atomic_set::<f64>(&item, 40, -0.125).unwrap();
    assert_eq!(fam.atomic_fetch::<f64>(&item, 40).unwrap(), -0.125);

    let wide = (42i128 << 80) | 7;
    fam.atomic_set_i128(&item, 48, wide).unwrap();
    assert_eq!(fam.atomic_fetch_i128(&item, 48).unwrap(), wide);
}

#[test]
fn fetch_add_with_zero_delta_is_idempotent() {
    let fam = runtime(1, "at_zero_delta");
    let item = item(&fam, "zero_delta");

    fam.atomic_set::<u64>(&item, 0, 4242).unwrap();
    fam.quiet().unwrap();
    assert_eq!(fam.atomic_fetch_add::<u64>(&item, 0, 0).unwrap(), 4242);
    assert_eq!(fam.atomic_fetch::<u64>(&item, 0).unwrap(), 4242);
}

#[test]
fn arithmetic_family() {
    let fam = runtime(1, "at_arith");
    let item = item(&fam, "arith");

    fam.atomic_set::<i64>(&item, 0, 100).unwrap();
    assert_eq!(fam.atomic_fetch_add::<i64>(&item, 0, 23).unwrap(), 100);
    assert_eq!(fam.atomic_fetch_subtract::<i64>(&item, 0, 3).unwrap(), 123);
    fam.atomic_add::<i64>(&item, 0, 10).unwrap();
    fam.atomic_subtract::<i64>(&item, 0, 30).unwrap();
    assert_eq!(fam.atomic_fetch::<i64>(&item, 0).unwrap(), 100);

    fam.atomic_set::<i32>(&item, 8, 50).unwrap();
    fam.atomic_min::<i32>(&item, 8, 40).unwrap();
    assert_eq!(fam.atomic_fetch::<i32>(&item, 8).unwrap(), 40);
    fam.atomic_max::<i32>(&item, 8, 90).unwrap();
    assert_eq!(fam.atomic_fetch::<i32>(&item, 8).unwrap(), 90);
    assert_eq!(fam.atomic_fetch_min::<i32>(&item, 8, 95).unwrap(), 90);
    assert_eq!(fam.atomic_fetch::<i32>(&item, 8).unwrap(), 90);

    fam.atomic_set::<f64>(&item, 16, 1.5).unwrap();
    assert_eq!(fam.atomic_fetch_add::<f64>(&item, 16, 0.25).unwrap(), 1.5);
    assert_eq!(fam.atomic_fetch::<f64>(&item, 16).unwrap(), 1.75);
    fam.atomic_max::<f64>(&item, 16, 3.0).unwrap();
    assert_eq!(fam.atomic_fetch::<f64>(&item, 16).unwrap(), 3.0);
}

#[test]
fn compare_swap_hit_and_miss() {
    let fam = runtime(1, "at_cas");
    let item = item(&fam, "cas");

    fam.atomic_set::<u64>(&item, 0, 0xa).unwrap();
    let old = fam.compare_swap::<u64>(&item, 0, 0xa, 0xb).unwrap();
    assert_eq!(old, 0xa);
    assert_eq!(fam.atomic_fetch::<u64>(&item, 0).unwrap(), 0xb);

    // Mismatched expected value: reports the current value, cell unchanged.
    let old = fam.compare_swap::<u64>(&item, 0, 0xa, 0xc).unwrap();
    assert_eq!(old, 0xb);
    assert_eq!(fam.atomic_fetch::<u64>(&item, 0).unwrap(), 0xb);
}

#[test]
fn swap_returns_previous_value() {
    let fam = runtime(1, "at_swap");
    let item = item(&fam, "swap");

    fam.atomic_set::<u32>(&item, 0, 7).unwrap();
    assert_eq!(fam.swap::<u32>(&item, 0, 9).unwrap(), 7);
    assert_eq!(fam.atomic_fetch::<u32>(&item, 0).unwrap(), 9);

    fam.atomic_set::<f32>(&item, 4, 1.0).unwrap();
    assert_eq!(fam.swap::<f32>(&item, 4, 2.0).unwrap(), 1.0);
    assert_eq!(fam.atomic_fetch::<f32>(&item, 4).unwrap(), 2.0);
}

#[test]
fn bitwise_and_scenario() {
    let fam = runtime(1, "at_bitwise");
    let item = item(&fam, "bitwise");

    fam.atomic_set::<u32>(&item, 64, 0xAAAA_AAAA).unwrap();
    fam.quiet().unwrap();
    let old = fam.atomic_fetch_and::<u32>(&item, 64, 0x1234_5678).unwrap();
    assert_eq!(old, 0xAAAA_AAAA);
    assert_eq!(fam.atomic_fetch::<u32>(&item, 64).unwrap(), 0x0220_0228);

    fam.atomic_set::<u32>(&item, 68, 0xF0F0_0F0F).unwrap();
    fam.atomic_or::<u32>(&item, 68, 0x0000_FF00).unwrap();
    assert_eq!(fam.atomic_fetch::<u32>(&item, 68).unwrap(), 0xF0F0_FF0F);
    assert_eq!(
        fam.atomic_fetch_xor::<u32>(&item, 68, 0xFFFF_FFFF).unwrap(),
        0xF0F0_FF0F
    );
    assert_eq!(fam.atomic_fetch::<u32>(&item, 68).unwrap(), 0x0F0F_00F0);
}

#[test]
fn ten_threads_fetch_or_their_own_slots() {
    let fam = runtime(1, "at_mt");
    let region = fam.create_region("mt_or", 1 << 20, 0o777, None).unwrap();
    let item = fam.allocate("slots", 80, 0o600, &region).unwrap();
    let fam = &fam;
    let item = &item;

    std::thread::scope(|scope| {
        for t in 0..10u64 {
            scope.spawn(move || {
                let offset = t * 8;
                fam.atomic_set::<u64>(item, offset, 0xAAAA_AAAA_AAAA_AAAA)
                    .unwrap();
                fam.quiet().unwrap();
                let old = fam
                    .atomic_fetch_or::<u64>(item, offset, 0x1234_5678_90AB_CDEF)
                    .unwrap();
                assert_eq!(old, 0xAAAA_AAAA_AAAA_AAAA);
                assert_eq!(
                    fam.atomic_fetch::<u64>(item, offset).unwrap(),
                    0xBABE_FEFA_BAAB_EFEF
                );
            });
        }
    });
}

#[test]
fn concurrent_fetch_add_on_one_counter() {
    let fam = runtime(1, "at_counter");
    let item = item(&fam, "counter");
    fam.atomic_set::<u64>(&item, 0, 0).unwrap();
    let fam = &fam;
    let item = &item;

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(move || {
                for _ in 0..1000 {
                    fam.atomic_fetch_add::<u64>(item, 0, 1).unwrap();
                }
            });
        }
    });
    assert_eq!(fam.atomic_fetch::<u64>(item, 0).unwrap(), 8000);
}

#[test]
fn i128_compare_swap_through_the_server_mutex() {
    let fam = runtime(1, "at_i128");
    let item = item(&fam, "i128");

    let a = (1i128 << 90) + 17;
    let b = -(1i128 << 100);
    fam.atomic_set_i128(&item, 0, a).unwrap();
    let old = fam.compare_swap_i128(&item, 0, a, b).unwrap();
    assert_eq!(old, a);
    assert_eq!(fam.atomic_fetch_i128(&item, 0).unwrap(), b);

    let old = fam.compare_swap_i128(&item, 0, a, 5).unwrap();
    assert_eq!(old, b);
    assert_eq!(fam.atomic_fetch_i128(&item, 0).unwrap(), b);
}

#[test]
fn atomics_on_an_interleaved_item() {
    let fam = runtime(2, "at_interleaved");
    let region = fam.create_region("wide_at", 8 << 20, 0o777, None).unwrap();
    let item = fam.allocate("cells", 64 * 1024, 0o600, &region).unwrap();
    assert_eq!(item.used_memsrv_cnt(), 2);

    // Offsets 0 and 4096 land in different interleave chunks, on different
    // memory servers.
    for offset in [0u64, 8, 4096, 4104] {
        fam.atomic_set::<u64>(&item, offset, offset + 1).unwrap();
    }
    for offset in [0u64, 8, 4096, 4104] {
        assert_eq!(fam.atomic_fetch::<u64>(&item, offset).unwrap(), offset + 1);
        assert_eq!(
            fam.atomic_fetch_add::<u64>(&item, offset, 10).unwrap(),
            offset + 1
        );
    }

    // The 128-bit path keys its server mutex off the owning server.
    fam.atomic_set_i128(&item, 16, 1 << 70).unwrap();
    fam.atomic_set_i128(&item, 4096 + 16, 1 << 71).unwrap();
    assert_eq!(fam.atomic_fetch_i128(&item, 16).unwrap(), 1 << 70);
    assert_eq!(fam.atomic_fetch_i128(&item, 4096 + 16).unwrap(), 1 << 71);
}

#[test]
fn misalignment_is_invalid() {
    let fam = runtime(1, "at_align");
    let item = item(&fam, "align");

    let err = fam.atomic_set::<u64>(&item, 12, 1).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::Invalid);
    let err = fam.atomic_fetch::<u32>(&item, 6).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::Invalid);
    let err = fam.atomic_set_i128(&item, 8, 1).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::Invalid);
    let err = fam.compare_swap::<i32>(&item, 2, 0, 1).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::Invalid);
}

#[test]
fn out_of_bounds_atomics_are_rejected() {
    let fam = runtime(1, "at_oob");
    let item = item(&fam, "oob");

    let err = fam.atomic_set::<u64>(&item, 4096, 1).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::OutOfRange);
    let err = fam.atomic_fetch::<u64>(&item, 4092).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::Invalid);
    let err = fam.atomic_fetch::<u32>(&item, 4096).unwrap_err();
    assert_eq!(err.kind(), FamErrorKind::OutOfRange);
}

#[test]
fn atomics_work_through_a_context() {
    let fam = runtime(1, "at_ctx");
    let item = item(&fam, "ctx");

    let ctx = fam.context_open().unwrap();
    ctx.atomic_set::<u64>(&item, 0, 11).unwrap();
    assert_eq!(ctx.atomic_fetch_add::<u64>(&item, 0, 4).unwrap(), 11);
    assert_eq!(ctx.atomic_fetch::<u64>(&item, 0).unwrap(), 15);
    assert_eq!(ctx.compare_swap::<u64>(&item, 0, 15, 16).unwrap(), 15);

    ctx.atomic_subtract::<u64>(&item, 0, 6).unwrap();
    ctx.atomic_min::<u64>(&item, 0, 7).unwrap();
    ctx.atomic_max::<u64>(&item, 0, 9).unwrap();
    assert_eq!(ctx.atomic_fetch::<u64>(&item, 0).unwrap(), 9);
    assert_eq!(ctx.swap::<u64>(&item, 0, 1).unwrap(), 9);

    ctx.atomic_set::<u32>(&item, 8, 0x0f0f_0f0f).unwrap();
    ctx.atomic_or::<u32>(&item, 8, 0xf000_0000).unwrap();
    assert_eq!(
        ctx.atomic_fetch_and::<u32>(&item, 8, 0xff00_00ff).unwrap(),
        0xff0f_0f0f
    );
    assert_eq!(
        ctx.atomic_fetch_xor::<u32>(&item, 8, 0x0000_00ff).unwrap(),
        0xff00_000f
    );

    ctx.atomic_set_i128(&item, 16, 1 << 80).unwrap();
    assert_eq!(ctx.compare_swap_i128(&item, 16, 1 << 80, 2).unwrap(), 1 << 80);
    assert_eq!(ctx.atomic_fetch_i128(&item, 16).unwrap(), 2);

    fam.context_close(ctx).unwrap();
}
