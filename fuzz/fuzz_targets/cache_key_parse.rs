//! Fuzz cache key parsing with arbitrary UTF-8.
//!
//! Run with: cargo +nightly fuzz run cache_key_parse -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use stratus_core::CacheKey;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    // Any key that parses must survive a re-encode unchanged.
    if let Ok(key) = CacheKey::parse(input) {
        let encoded = key.encode();
        let reparsed = CacheKey::parse(&encoded).expect("encoded key parses");
        assert_eq!(key, reparsed);
    }
});
