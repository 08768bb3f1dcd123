//! Small fuzzy matcher for identifier lookup and result filtering
//!
//! Case-insensitive. A prefix hit beats a substring hit, which beats a
//! subsequence with gaps; within a quality, higher scores rank first.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchQuality {
    Fuzzy = 1,
    Substring = 2,
    Prefix = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuzzyMatch {
    pub quality: MatchQuality,
    pub score: i32,
}

/// Match `pattern` against `candidate`, `None` when the characters of the
/// pattern do not appear in order
pub fn fuzzy_match(pattern: &str, candidate: &str) -> Option<FuzzyMatch> {
    let pattern = pattern.to_lowercase();
    let candidate = candidate.to_lowercase();
    if pattern.is_empty() {
        return Some(FuzzyMatch {
            quality: MatchQuality::Prefix,
            score: 0,
        });
    }

    if candidate.starts_with(&pattern) {
        // Shorter candidates are closer to what was typed
        let extra = candidate.chars().count() - pattern.chars().count();
        return Some(FuzzyMatch {
            quality: MatchQuality::Prefix,
            score: 1000 - extra.min(999) as i32,
        });
    }
    if let Some(pos) = candidate.find(&pattern) {
        return Some(FuzzyMatch {
            quality: MatchQuality::Substring,
            score: 800 - pos.min(799) as i32,
        });
    }

    // Subsequence: reward consecutive runs and word-start hits, punish gaps
    let chars: Vec<char> = candidate.chars().collect();
    let mut score = 0i32;
    let mut pos = 0usize;
    let mut prev: Option<usize> = None;
    for wanted in pattern.chars() {
        let found = chars[pos..].iter().position(|c| *c == wanted)? + pos;
        score += 10;
        if found == 0 || matches!(chars.get(found.wrapping_sub(1)), Some('_' | '.' | ' ')) {
            score += 8;
        }
        match prev {
            Some(p) if found == p + 1 => score += 5,
            Some(p) => score -= (found - p - 1).min(10) as i32,
            None => score -= found.min(10) as i32,
        }
        prev = Some(found);
        pos = found + 1;
    }
    Some(FuzzyMatch {
        quality: MatchQuality::Fuzzy,
        score,
    })
}
