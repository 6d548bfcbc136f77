use ltcspv_pow::{compact_to_target, hash_meets_target, target_to_compact};

#[test]
fn compact_to_target_roundtrip() {
    for bits in [0x1d00ffffu32, 0x1e0ffff0, 0x1e0fffff] {
        let target = compact_to_target(bits).expect("target");
        let back = target_to_compact(&target);
        assert_eq!(back, bits);
    }
}

#[test]
fn compact_target_layout() {
    let bits = 0x207fffff;
    let target = compact_to_target(bits).expect("target");
    assert!(target[..29].iter().all(|b| *b == 0));
    assert_eq!(target[29], 0xff);
    assert_eq!(target[30], 0xff);
    assert_eq!(target[31], 0x7f);
}

#[test]
fn genesis_bits_layout() {
    // 0x1e0ffff0 is the litecoin genesis target: 0x0ffff0 shifted 27 bytes.
    let target = compact_to_target(0x1e0ffff0).expect("target");
    assert!(target[..27].iter().all(|b| *b == 0));
    assert_eq!(target[27], 0xf0);
    assert_eq!(target[28], 0xff);
    assert_eq!(target[29], 0x0f);
    assert_eq!(target[30], 0x00);
    assert_eq!(target[31], 0x00);
}

#[test]
fn hash_meets_target_cmp() {
    let target = [0x10u8; 32];
    let smaller = [0x00u8; 32];
    let larger = [0xffu8; 32];
    assert!(hash_meets_target(&smaller, &target));
    assert!(!hash_meets_target(&larger, &target));
    assert!(hash_meets_target(&target, &target));
}
