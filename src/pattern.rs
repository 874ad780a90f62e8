//! Synthesizes glob patterns that pick one string out of a set of alternatives,
//! e.g. `tool-*-linux.tar.gz` for one asset among those of a release.

use std::collections::{BTreeSet, HashMap, VecDeque};
use glob::Pattern;
use regex::Regex;
use tracing::debug;
use crate::error::NoPatternError;

/// Returns a glob pattern that matches `selection` but none of `alternatives`.
///
/// Candidates are tried in this order, the first valid one wins:
/// 1. `version` (with optional leading `v`, any punctuation) replaced by `*`;
/// 2. the shortest substring unique to `selection`, wrapped in `*`;
/// 3. every run of characters `selection` shares with all alternatives replaced by `*`.
pub fn identifying_pattern<S: AsRef<str>>(
    selection: &str,
    alternatives: &[S],
    version: Option<&str>,
) -> Result<String, NoPatternError> {
    let alternatives: Vec<&str> = alternatives
        .iter()
        .map(AsRef::as_ref)
        .filter(|alternative| *alternative != selection)
        .collect();
    let fail = |reason: String| NoPatternError { selection: selection.to_string(), reason };

    if let Some(version) = version {
        if let Some(pattern) = mask_version(selection, version) {
            match check_candidate(&pattern, selection, &alternatives) {
                Ok(()) => return Ok(pattern),
                Err(reason) => debug!("Version pattern rejected: {reason}"),
            }
        }
    }

    let mut strings = vec![selection];
    strings.extend(alternatives.iter().copied());
    if let Some(substring) = unique_substrings(&strings).remove(selection) {
        let pattern = wrap_substring(selection, &substring);
        match check_candidate(&pattern, selection, &alternatives) {
            Ok(()) => return Ok(pattern),
            Err(reason) => debug!("Substring pattern rejected: {reason}"),
        }
    }

    let pattern = mask_common(selection, &alternatives);
    check_candidate(&pattern, selection, &alternatives).map_err(fail)?;
    Ok(pattern)
}

fn check_candidate(pattern: &str, selection: &str, alternatives: &[&str]) -> Result<(), String> {
    let compiled = Pattern::new(pattern)
        .map_err(|e| format!("`{pattern}` is not a valid pattern: {}", e.msg))?;
    if !compiled.matches(selection) {
        return Err(format!("the candidate `{pattern}` does not match `{selection}`"));
    }
    let matching: Vec<&str> =
        alternatives.iter().copied().filter(|a| compiled.matches(a)).collect();
    if !matching.is_empty() {
        return Err(format!(
            "the candidate `{pattern}` matches {} alternatives: {}",
            matching.len(),
            matching.join(", ")
        ));
    }
    Ok(())
}

/// Replaces the first occurrence of `version` in `selection` by `*`.
fn mask_version(selection: &str, version: &str) -> Option<String> {
    let bare = version.trim_start_matches(['v', 'V']);
    if bare.is_empty() {
        return None;
    }
    let body: String = bare
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' {
                regex::escape(&c.to_string())
            } else {
                r"\W".to_string()
            }
        })
        .collect();
    let re = Regex::new(&format!("(?i)v?{body}")).ok()?;
    let found = re.find(selection)?;
    Some(format!(
        "{}*{}",
        Pattern::escape(&selection[..found.start()]),
        Pattern::escape(&selection[found.end()..])
    ))
}

fn wrap_substring(selection: &str, substring: &str) -> String {
    let escaped = Pattern::escape(substring);
    let head = if selection.starts_with(substring) { "" } else { "*" };
    let tail = if selection.ends_with(substring) { "" } else { "*" };
    format!("{head}{escaped}{tail}")
}

/// Maps each string to its shortest substring that occurs nowhere else in `strings`,
/// neither in another string nor a second time in itself.
///
/// Strings fully contained in another one have no such substring and are missing
/// from the result:
/// `["ab", "abab", "abc"]` gives `{"abab": "ba", "abc": "c"}`.
pub fn unique_substrings<S: AsRef<str>>(strings: &[S]) -> HashMap<String, String> {
    // substring -> owner, None once seen twice; Vec keeps first-seen order for ties
    let mut order: Vec<String> = Vec::new();
    let mut owners: HashMap<String, Option<usize>> = HashMap::new();
    for (index, string) in strings.iter().enumerate() {
        let chars: Vec<char> = string.as_ref().chars().collect();
        for length in 1..chars.len() {
            for start in 0..=chars.len() - length {
                let substring: String = chars[start..start + length].iter().collect();
                match owners.get_mut(&substring) {
                    Some(owner) => *owner = None,
                    None => {
                        owners.insert(substring.clone(), Some(index));
                        order.push(substring);
                    }
                }
            }
        }
    }

    let mut unique: HashMap<String, String> = HashMap::new();
    for substring in order {
        let Some(Some(index)) = owners.get(&substring) else {
            continue;
        };
        let owner = strings[*index].as_ref();
        match unique.get(owner) {
            Some(best) if best.chars().count() <= substring.chars().count() => {}
            _ => {
                unique.insert(owner.to_string(), substring);
            }
        }
    }
    unique
}

/// Replaces each maximal run of positions that lie in a matching block against every
/// alternative by a single `*`.
fn mask_common(selection: &str, alternatives: &[&str]) -> String {
    let chars: Vec<char> = selection.chars().collect();
    let mut common: BTreeSet<usize> = (0..chars.len()).collect();
    for alternative in alternatives {
        let other: Vec<char> = alternative.chars().collect();
        let matched: BTreeSet<usize> = matching_blocks(&chars, &other)
            .into_iter()
            .flat_map(|block| block.a..block.a + block.size)
            .collect();
        common = common.intersection(&matched).copied().collect();
    }

    let mut pattern = String::new();
    for (i, c) in chars.iter().enumerate() {
        if common.contains(&i) {
            if i == 0 || !common.contains(&(i - 1)) {
                pattern.push('*');
            }
        } else {
            pattern.push_str(&Pattern::escape(&c.to_string()));
        }
    }
    pattern
}

/// `a[a..a + size] == b[b..b + size]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    a: usize,
    b: usize,
    size: usize,
}

/// Non-overlapping matching blocks found by recursively taking the longest common
/// substring and recursing left and right of it.
fn matching_blocks(a: &[char], b: &[char]) -> Vec<Block> {
    let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
    for (j, c) in b.iter().enumerate() {
        b2j.entry(*c).or_default().push(j);
    }

    let mut blocks = Vec::new();
    let mut queue = VecDeque::from([(0, a.len(), 0, b.len())]);
    while let Some((alo, ahi, blo, bhi)) = queue.pop_front() {
        let block = longest_match(a, &b2j, alo, ahi, blo, bhi);
        if block.size == 0 {
            continue;
        }
        if alo < block.a && blo < block.b {
            queue.push_back((alo, block.a, blo, block.b));
        }
        if block.a + block.size < ahi && block.b + block.size < bhi {
            queue.push_back((block.a + block.size, ahi, block.b + block.size, bhi));
        }
        blocks.push(block);
    }
    blocks.sort_by_key(|block| (block.a, block.b));
    blocks
}

fn longest_match(
    a: &[char],
    b2j: &HashMap<char, Vec<usize>>,
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> Block {
    let mut best = Block { a: alo, b: blo, size: 0 };
    let mut j2len: HashMap<usize, usize> = HashMap::new();
    for i in alo..ahi {
        let mut next: HashMap<usize, usize> = HashMap::new();
        for &j in b2j.get(&a[i]).map(Vec::as_slice).unwrap_or_default() {
            if j < blo {
                continue;
            }
            if j >= bhi {
                break;
            }
            let k = j.checked_sub(1).and_then(|prev| j2len.get(&prev)).copied().unwrap_or(0) + 1;
            next.insert(j, k);
            if k > best.size {
                best = Block { a: i + 1 - k, b: j + 1 - k, size: k };
            }
        }
        j2len = next;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ASSETS: [&str; 4] = [
        "tool-v1.2.0-x86_64-unknown-linux-musl.tar.gz",
        "tool-v1.2.0-aarch64-unknown-linux-musl.tar.gz",
        "tool-v1.2.0-x86_64-pc-windows-msvc.zip",
        "tool-v1.2.0-x86_64-apple-darwin.tar.gz",
    ];

    fn assert_identifies(pattern: &str, selection: &str, alternatives: &[&str]) {
        let compiled = Pattern::new(pattern).unwrap();
        assert!(compiled.matches(selection), "{pattern} should match {selection}");
        for alternative in alternatives.iter().filter(|a| **a != selection) {
            assert!(!compiled.matches(alternative), "{pattern} should not match {alternative}");
        }
    }

    #[test]
    fn test_unique_substrings_skips_contained_strings() {
        let unique = unique_substrings(&["ab", "abab", "abc"]);
        let expected = HashMap::from([
            ("abab".to_string(), "ba".to_string()),
            ("abc".to_string(), "c".to_string()),
        ]);
        assert_eq!(unique, expected);
    }

    #[test]
    fn test_version_is_masked_first() {
        let pattern = identifying_pattern(ASSETS[0], &ASSETS, Some("v1.2.0")).unwrap();
        assert_eq!(pattern, "tool-*-x86_64-unknown-linux-musl.tar.gz");
        assert_identifies(&pattern, ASSETS[0], &ASSETS);
    }

    #[test]
    fn test_version_mask_is_case_insensitive_and_punctuation_agnostic() {
        assert_eq!(mask_version("Tool-V1-2-0.exe", "1.2.0").unwrap(), "Tool-*.exe");
        assert!(mask_version("tool.exe", "1.2.0").is_none());
    }

    #[test]
    fn test_falls_back_to_unique_substring() {
        let pattern = identifying_pattern(ASSETS[2], &ASSETS, None).unwrap();
        assert_eq!(pattern, "*-p*");
        assert_identifies(&pattern, ASSETS[2], &ASSETS);
    }

    #[test]
    fn test_unique_substring_touching_end() {
        let alternatives = ["foo-linux.tar.gz", "foo-linux.zip"];
        let pattern = identifying_pattern("foo-linux.zip", &alternatives, None).unwrap();
        assert_eq!(pattern, "*p");
    }

    #[test]
    fn test_common_runs_are_masked() {
        let alternatives = ["foo-windows.tar.gz", "foo-macos.tar.gz"];
        assert_eq!(mask_common("foo-linux.tar.gz", &alternatives), "*linux*");
        let chars: Vec<char> = "abxcd".chars().collect();
        let other: Vec<char> = "abycd".chars().collect();
        assert_eq!(
            matching_blocks(&chars, &other),
            vec![Block { a: 0, b: 0, size: 2 }, Block { a: 3, b: 3, size: 2 }]
        );
    }

    #[test]
    fn test_release_tags() {
        let tags = ["v2.0.0", "v1.10.0", "v1.9.3", "nightly"];
        let pattern = identifying_pattern("nightly", &tags, None).unwrap();
        assert_identifies(&pattern, "nightly", &tags);
        let pattern = identifying_pattern("v1.9.3", &tags, Some("v1.9.3")).unwrap();
        assert_identifies(&pattern, "v1.9.3", &tags);
    }

    #[test]
    fn test_contained_selection_fails() {
        let err = identifying_pattern("ab", &["abab"], None).unwrap_err();
        assert_eq!(err.selection, "ab");
    }

    #[test]
    fn test_no_alternatives_is_trivial() {
        assert_eq!(identifying_pattern("x", &[] as &[&str], None).unwrap(), "*");
        assert_eq!(identifying_pattern("tool", &["tool"], None).unwrap(), "t*");
    }

    #[test]
    fn test_glob_characters_are_escaped() {
        let alternatives = ["tool[linux].tgz", "tool[macos].tgz"];
        let pattern = identifying_pattern("tool[linux].tgz", &alternatives, None).unwrap();
        assert_identifies(&pattern, "tool[linux].tgz", &alternatives);
    }
}
