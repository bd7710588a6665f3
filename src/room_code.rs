//! Room identifier generation.
//!
//! DESIGN
//! ======
//! Codes are short enough to read aloud and paste into a chat. The
//! alphabet drops lookalike glyphs (I, L, O, 0, 1). Generation does not
//! check existing rooms for collisions; at 31^6 combinations that is a
//! documented residual risk, not a correctness concern.

use rand::Rng;

/// Code length in characters.
pub const CODE_LEN: usize = 6;

/// Uppercase alphanumerics minus ambiguous glyphs.
const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Generate a fresh room code.
#[must_use]
pub fn generate() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| {
            let idx = rng.random_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_code_has_fixed_length() {
        assert_eq!(generate().len(), CODE_LEN);
    }

    #[test]
    fn generated_code_uses_only_the_alphabet() {
        for _ in 0..100 {
            let code = generate();
            assert!(
                code.bytes().all(|b| ALPHABET.contains(&b)),
                "unexpected character in {code}"
            );
        }
    }

    #[test]
    fn generated_codes_are_case_normalized() {
        let code = generate();
        assert_eq!(code, code.to_uppercase());
    }
}
