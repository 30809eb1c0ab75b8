//! Fuzz cache key encoding with arbitrary segment text.
//!
//! Input is split on NUL into segments; the first four are the fixed parts.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stratus_core::CacheKey;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let segments: Vec<String> = input.split('\0').map(str::to_string).collect();
    if segments.len() < 4 {
        return;
    }

    let mut segments = segments.into_iter();
    let mut next = || segments.next().unwrap_or_default();
    let (provider, namespace, account, region) = (next(), next(), next(), next());
    let key = CacheKey::new(provider, namespace, account, region, segments.collect());

    let decoded = CacheKey::parse(&key.encode()).expect("encoded key parses");
    assert_eq!(key, decoded);
});
