//! Random pronounceable words and digit strings.

use rand::{Rng, RngCore};

const CONSONANTS: &[u8] = b"bcdfghjklmnprstvz";
const VOWELS: &[u8] = b"aeiou";

/// Lowercase word of `len` letters alternating consonants and vowels.
pub fn word(rng: &mut dyn RngCore, len: usize) -> String {
    let mut vowel = rng.gen_bool(0.5);
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        let set = if vowel { VOWELS } else { CONSONANTS };
        out.push(set[rng.gen_range(0..set.len())] as char);
        vowel = !vowel;
    }
    out
}

pub fn digits(rng: &mut dyn RngCore, len: usize) -> String {
    (0..len).map(|_| char::from(b'0' + rng.gen_range(0..10u8))).collect()
}

/// Same-length replacement for `label`: letters become a word, digits
/// become random digits, everything else is kept.
pub fn shape_like(rng: &mut dyn RngCore, label: &str) -> String {
    shape_like_with(rng, label, &|c| !c.is_ascii_alphanumeric())
}

/// Like [`shape_like`], keeping only the characters selected by `keep`.
/// Any other non-digit character counts as a letter.
pub fn shape_like_with(rng: &mut dyn RngCore, label: &str, keep: &dyn Fn(char) -> bool) -> String {
    let class = |c: char| {
        if keep(c) { 0 } else if c.is_ascii_digit() { 1 } else { 2 }
    };
    let chars: Vec<char> = label.chars().collect();
    let mut out = String::with_capacity(label.len());
    let mut i = 0;
    while i < chars.len() {
        let k = class(chars[i]);
        let run = chars[i..].iter().take_while(|c| class(**c) == k).count();
        let part: String = chars[i..i + run].iter().collect();
        match k {
            0 => out.push_str(&part),
            1 => out.push_str(&digits(rng, run)),
            _ => out.push_str(&apply_case(&part, &word(rng, run))),
        }
        i += run;
    }
    out
}

/// Copies the letter case of `template` onto `word`, position by position.
pub fn apply_case(template: &str, word: &str) -> String {
    let mut t = template.chars();
    word.chars()
        .map(|c| match t.next() {
            Some(tc) if tc.is_uppercase() => c.to_ascii_uppercase(),
            _ => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn word_alternates() {
        let mut rng = StdRng::seed_from_u64(1);
        let w = word(&mut rng, 8);
        assert_eq!(w.len(), 8);
        let v: Vec<bool> = w.bytes().map(|b| VOWELS.contains(&b)).collect();
        assert!(v.windows(2).all(|p| p[0] != p[1]));
    }

    #[test]
    fn shape_keeps_classes() {
        let mut rng = StdRng::seed_from_u64(2);
        let s = shape_like(&mut rng, "Srv-01_a");
        assert_eq!(s.len(), 8);
        assert!(s.as_bytes()[0].is_ascii_uppercase());
        assert_eq!(&s[3..4], "-");
        assert!(s[4..6].bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(&s[6..7], "_");
    }

    #[test]
    fn selected_characters_only() {
        let mut rng = StdRng::seed_from_u64(3);
        let s = shape_like_with(&mut rng, "a_b-c", &|c| c == '-');
        assert_eq!(s.len(), 5);
        assert_eq!(&s[3..4], "-");
        assert_ne!(&s[1..2], "_");
    }

    #[test] fn case_pattern() { assert_eq!(apply_case("AbC", "xyzw"), "XyZw"); }
}
