//! Vector-dispatched case-insensitive substring and wildcard matching.
//!
//! At first use the widest available tier is detected (256-bit, 128-bit,
//! scalar). All tiers are semantically identical; only throughput differs.
//! The vector paths fold ASCII case with a bitwise OR 0x20 inside the
//! comparison and verify candidate windows with an exact case-insensitive
//! compare, so fold collisions on non-letter bytes never produce a match.
//! Inputs containing non-ASCII text take the full Unicode case-folding
//! path directly.

use std::sync::OnceLock;

/// The matcher implementation selected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    /// 256-bit AVX2 path, 32 lanes.
    Avx2,
    /// 128-bit SSE2 path, 16 lanes.
    Sse2,
    /// Portable scalar path.
    Scalar,
}

static TIER: OnceLock<MatchTier> = OnceLock::new();

/// The tier in use for this process.
pub fn active_tier() -> MatchTier {
    *TIER.get_or_init(detect_tier)
}

#[cfg(target_arch = "x86_64")]
fn detect_tier() -> MatchTier {
    if is_x86_feature_detected!("avx2") {
        MatchTier::Avx2
    } else {
        MatchTier::Sse2
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_tier() -> MatchTier {
    MatchTier::Scalar
}

/// Case-insensitive substring test.
pub fn contains_ci(haystack: &str, needle: &str) -> bool {
    contains_ci_with_tier(haystack, needle, active_tier())
}

/// Case-sensitive (ordinal) substring test.
pub fn contains_cs(haystack: &str, needle: &str) -> bool {
    memchr::memmem::find(haystack.as_bytes(), needle.as_bytes()).is_some()
}

fn contains_ci_with_tier(haystack: &str, needle: &str, tier: MatchTier) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    if !haystack.is_ascii() || !needle.is_ascii() {
        // Unicode path: full case folding on both sides.
        return haystack.to_lowercase().contains(&needle.to_lowercase());
    }

    let hay = haystack.as_bytes();
    let pat = needle.as_bytes();
    let positions = hay.len() - pat.len() + 1;
    match tier {
        #[cfg(target_arch = "x86_64")]
        MatchTier::Avx2 if positions >= 32 => unsafe { contains_ci_avx2(hay, pat) },
        #[cfg(target_arch = "x86_64")]
        MatchTier::Avx2 | MatchTier::Sse2 if positions >= 16 => unsafe {
            contains_ci_sse2(hay, pat)
        },
        _ => scalar_contains_ci(hay, pat, 0),
    }
}

/// Scalar tier: memchr-accelerated first-byte candidates, verified with an
/// exact case-insensitive window compare. Also serves as the vector tail.
fn scalar_contains_ci(hay: &[u8], pat: &[u8], from: usize) -> bool {
    let n = pat.len();
    if hay.len() < n {
        return false;
    }
    let end = hay.len() - n + 1;
    let lower = pat[0].to_ascii_lowercase();
    let upper = pat[0].to_ascii_uppercase();
    let mut i = from;
    while i < end {
        let window = &hay[i..end];
        let found = if lower == upper {
            memchr::memchr(lower, window)
        } else {
            memchr::memchr2(lower, upper, window)
        };
        let pos = match found {
            Some(offset) => i + offset,
            None => return false,
        };
        if hay[pos..pos + n].eq_ignore_ascii_case(pat) {
            return true;
        }
        i = pos + 1;
    }
    false
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn contains_ci_avx2(hay: &[u8], pat: &[u8]) -> bool {
    use std::arch::x86_64::*;

    let n = pat.len();
    let positions = hay.len() - n + 1;
    let first = _mm256_set1_epi8((pat[0] | 0x20) as i8);
    let last = _mm256_set1_epi8((pat[n - 1] | 0x20) as i8);
    let fold = _mm256_set1_epi8(0x20);

    let mut i = 0usize;
    while i + 32 <= positions {
        let head = _mm256_loadu_si256(hay.as_ptr().add(i) as *const __m256i);
        let tail = _mm256_loadu_si256(hay.as_ptr().add(i + n - 1) as *const __m256i);
        let eq_head = _mm256_cmpeq_epi8(_mm256_or_si256(head, fold), first);
        let eq_tail = _mm256_cmpeq_epi8(_mm256_or_si256(tail, fold), last);
        let mut mask = _mm256_movemask_epi8(_mm256_and_si256(eq_head, eq_tail)) as u32;
        while mask != 0 {
            let pos = i + mask.trailing_zeros() as usize;
            if hay[pos..pos + n].eq_ignore_ascii_case(pat) {
                return true;
            }
            mask &= mask - 1;
        }
        i += 32;
    }
    scalar_contains_ci(hay, pat, i)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn contains_ci_sse2(hay: &[u8], pat: &[u8]) -> bool {
    use std::arch::x86_64::*;

    let n = pat.len();
    let positions = hay.len() - n + 1;
    let first = _mm_set1_epi8((pat[0] | 0x20) as i8);
    let last = _mm_set1_epi8((pat[n - 1] | 0x20) as i8);
    let fold = _mm_set1_epi8(0x20);

    let mut i = 0usize;
    while i + 16 <= positions {
        let head = _mm_loadu_si128(hay.as_ptr().add(i) as *const __m128i);
        let tail = _mm_loadu_si128(hay.as_ptr().add(i + n - 1) as *const __m128i);
        let eq_head = _mm_cmpeq_epi8(_mm_or_si128(head, fold), first);
        let eq_tail = _mm_cmpeq_epi8(_mm_or_si128(tail, fold), last);
        let mut mask = _mm_movemask_epi8(_mm_and_si128(eq_head, eq_tail)) as u32;
        while mask != 0 {
            let pos = i + mask.trailing_zeros() as usize;
            if hay[pos..pos + n].eq_ignore_ascii_case(pat) {
                return true;
            }
            mask &= mask - 1;
        }
        i += 16;
    }
    scalar_contains_ci(hay, pat, i)
}

// ---------------------------------------------------------------------------
// Wildcard matching
// ---------------------------------------------------------------------------

/// Matches `text` against a pattern where `*` matches any run of characters
/// and `?` matches exactly one.
pub fn matches_wildcard(text: &str, pattern: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        wildcard_match_chars(
            &text.chars().collect::<Vec<_>>(),
            &pattern.chars().collect::<Vec<_>>(),
        )
    } else {
        let text = text.to_lowercase();
        let pattern = pattern.to_lowercase();
        wildcard_match_chars(
            &text.chars().collect::<Vec<_>>(),
            &pattern.chars().collect::<Vec<_>>(),
        )
    }
}

fn wildcard_match_chars(text: &[char], pattern: &[char]) -> bool {
    let mut text_index = 0usize;
    let mut pattern_index = 0usize;
    let mut star_index: Option<usize> = None;
    let mut star_text_index = 0usize;

    while text_index < text.len() {
        if pattern_index < pattern.len()
            && (pattern[pattern_index] == '?' || pattern[pattern_index] == text[text_index])
        {
            pattern_index += 1;
            text_index += 1;
            continue;
        }

        if pattern_index < pattern.len() && pattern[pattern_index] == '*' {
            star_index = Some(pattern_index);
            pattern_index += 1;
            star_text_index = text_index;
            continue;
        }

        if let Some(last_star) = star_index {
            pattern_index = last_star + 1;
            star_text_index += 1;
            text_index = star_text_index;
            continue;
        }

        return false;
    }

    while pattern_index < pattern.len() && pattern[pattern_index] == '*' {
        pattern_index += 1;
    }

    pattern_index == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tiers that are actually runnable on the current machine.
    fn available_tiers() -> Vec<MatchTier> {
        let mut tiers = vec![MatchTier::Scalar];
        #[cfg(target_arch = "x86_64")]
        {
            tiers.push(MatchTier::Sse2);
            if is_x86_feature_detected!("avx2") {
                tiers.push(MatchTier::Avx2);
            }
        }
        tiers
    }

    fn naive_contains_ci(haystack: &str, needle: &str) -> bool {
        if needle.is_empty() {
            return true;
        }
        haystack.to_lowercase().contains(&needle.to_lowercase())
    }

    /// Deterministic pseudo-random corpus without a rand dependency.
    fn corpus() -> Vec<String> {
        let alphabet: Vec<char> = "abcDEFgh01._- /XyZ".chars().collect();
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut out = Vec::new();
        for len in [0usize, 1, 3, 15, 16, 17, 31, 32, 33, 64, 200] {
            let mut s = String::new();
            for _ in 0..len {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                s.push(alphabet[(state >> 33) as usize % alphabet.len()]);
            }
            out.push(s);
        }
        out
    }

    #[test]
    fn tiers_agree_with_reference() {
        let haystacks = corpus();
        let mut needles = corpus();
        needles.extend(
            ["a", "De", "gh0", "._-", "zzz", " /", "XYZ"]
                .iter()
                .map(|s| s.to_string()),
        );
        for tier in available_tiers() {
            for haystack in &haystacks {
                for needle in &needles {
                    assert_eq!(
                        contains_ci_with_tier(haystack, needle, tier),
                        naive_contains_ci(haystack, needle),
                        "tier {tier:?} diverged on haystack={haystack:?} needle={needle:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn case_insensitive_basics() {
        assert!(contains_ci("UserServiceTests.cs", "service"));
        assert!(contains_ci("CONFIG.JSON", "config"));
        assert!(!contains_ci("readme.md", "config"));
        assert!(contains_ci("anything", ""));
        assert!(!contains_ci("", "a"));
    }

    #[test]
    fn long_haystack_hits_vector_path() {
        let haystack = format!("{}{}", "x".repeat(500), "NeEdLe-in-here");
        assert!(contains_ci(&haystack, "needle-IN-HERE"));
        assert!(!contains_ci(&haystack, "needle-not-here"));
    }

    #[test]
    fn non_ascii_uses_unicode_folding() {
        assert!(contains_ci("ФАЙЛ.txt", "файл"));
        assert!(contains_ci("naïve.doc", "NAÏVE"));
    }

    #[test]
    fn case_sensitive_is_ordinal() {
        assert!(contains_cs("Config.json", "Config"));
        assert!(!contains_cs("Config.json", "config"));
    }

    #[test]
    fn wildcard_star_and_question() {
        assert!(matches_wildcard("x1.log", "x?.log", false));
        assert!(matches_wildcard("x2.log", "x?.log", false));
        assert!(!matches_wildcard("y.txt", "x?.log", false));
        assert!(!matches_wildcard("x12.log", "x?.log", false));
        assert!(matches_wildcard("report-final.txt", "report*.txt", false));
        assert!(matches_wildcard("anything", "*", false));
        assert!(matches_wildcard("", "*", false));
        assert!(!matches_wildcard("abc", "a?c?", false));
    }

    #[test]
    fn wildcard_case_modes() {
        assert!(matches_wildcard("Main.CS", "main.cs", false));
        assert!(!matches_wildcard("Main.CS", "main.cs", true));
        assert!(matches_wildcard("Main.CS", "Main.??", true));
    }
}
