#![no_main]

use libfuzzer_sys::fuzz_target;
use stampd_core::{merkle_root, AggregateTree};

fuzz_target!(|data: &[u8]| {
    // Interpret raw bytes as consecutive 32-byte digests.
    let digests: Vec<[u8; 32]> = data
        .chunks_exact(32)
        .map(|c| {
            let mut d = [0u8; 32];
            d.copy_from_slice(c);
            d
        })
        .collect();

    let r1 = merkle_root(&digests);
    let r2 = merkle_root(&digests);
    let root = match (r1, r2) {
        (Ok(a), Ok(b)) => {
            if a != b {
                panic!("merkle_root non-deterministic: {a:02x?} != {b:02x?}");
            }
            a
        }
        (Err(_), Err(_)) => {
            assert!(digests.is_empty(), "only an empty batch may fail");
            return;
        }
        _ => panic!("merkle_root non-deterministic error/ok mismatch"),
    };

    let tree = match AggregateTree::build(&digests) {
        Ok(tree) => tree,
        Err(e) => panic!("tree build failed where root succeeded: {e}"),
    };
    assert_eq!(tree.root(), root);
    for index in 0..digests.len() {
        match tree.proof(index) {
            Ok(proof) => assert!(proof.verify(&root), "proof {index} does not verify"),
            Err(e) => panic!("proof {index} failed: {e}"),
        }
    }
    assert!(tree.proof(digests.len()).is_err());
});
