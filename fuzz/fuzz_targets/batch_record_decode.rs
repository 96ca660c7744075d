#![no_main]

use libfuzzer_sys::fuzz_target;
use stampd_store::keys::{
    decode_batch_record, decode_digest_record, encode_batch_record, encode_digest_record,
};

fuzz_target!(|data: &[u8]| {
    let root = [0x5a; 32];
    // Anything that decodes must re-encode to the same bytes.
    if let Ok(rec) = decode_batch_record(&root, data) {
        assert_eq!(encode_batch_record(&rec), data);
    }
    if let Ok(rec) = decode_digest_record(data) {
        assert_eq!(encode_digest_record(&rec), data);
    }
});
