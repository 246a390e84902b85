//! RFC 8701 reserved codepoints. Browsers scatter them through suites, groups,
//! versions and extension types; templates keep them in place, fingerprint
//! digests leave them out.

/// `0x?a?a` with both bytes equal.
pub fn is_grease(value: u16) -> bool {
    let [hi, lo] = value.to_be_bytes();
    hi == lo && hi & 0x0f == 0x0a
}

/// `values` minus the GREASE entries, order kept.
pub fn without_grease(values: &[u16]) -> Vec<u16> {
    values.iter().copied().filter(|&v| !is_grease(v)).collect()
}
