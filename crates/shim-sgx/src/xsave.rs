// SPDX-License-Identifier: Apache-2.0

//! Size of the XSAVE area for the enabled state components

/// Legacy region and XSAVE header
pub const XSAVE_BASE_SIZE: usize = 512 + 64;

/// Extended state components in standard format: `(bit, offset, size)`
const COMPONENTS: [(u32, usize, usize); 7] = [
    (2, 576, 256),   // AVX
    (3, 960, 64),    // MPX bound registers
    (4, 1024, 64),   // MPX bound config
    (5, 1088, 64),   // AVX-512 opmask
    (6, 1152, 512),  // AVX-512 ZMM_Hi256
    (7, 1664, 1024), // AVX-512 Hi16_ZMM
    (9, 2688, 8),    // PKRU
];

/// Size of the standard format XSAVE area for the components enabled in `xfrm`
pub fn xsave_size(xfrm: u64) -> usize {
    COMPONENTS
        .iter()
        .filter(|(bit, ..)| xfrm & (1u64 << *bit) != 0)
        .map(|(_, offset, size)| offset + size)
        .fold(XSAVE_BASE_SIZE, usize::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        // x87 and SSE live in the legacy region
        assert_eq!(xsave_size(0x3), 576);
        assert_eq!(xsave_size(0x7), 832);
        assert_eq!(xsave_size(0xe7), 2688);
        assert_eq!(xsave_size(0x2e7), 2696);
        assert_eq!(xsave_size(0x1f), 1088);
    }
}
