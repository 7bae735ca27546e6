//! Tokenizer runtime (spec §3 "Statistical token", §4.6 stage 1).
//!
//! Default scheme is OSB (orthogonal sparse bigrams): each token hashes a
//! word together with one word some fixed distance back, so that nearby
//! word-pair combinations — not just single words — become classifier
//! features. Output collapses into a tree keyed by hash so duplicates within
//! one task merge into a single [`Token`].

use std::collections::BTreeMap;

/// Window size for OSB pair generation; a token combines a word with each of
/// the up to 4 preceding words (spec's tokenizer is left as
/// implementation-defined beyond "OSB scheme by default" — 4 is the
/// classic OSB window and is documented here rather than silently guessed).
const OSB_WINDOW: usize = 4;

/// A positional hashed n-gram feature (spec §3 "Statistical token").
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Token {
    pub hash: u64,
    /// How many times this exact token occurred in the tokenized input;
    /// duplicates collapse into one [`Token`] with an incremented count
    /// rather than a repeated entry (spec §4.6 stage 1: "output is a tree
    /// keyed by token hash so that duplicates collapse").
    pub count: u32,
}

fn words(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Tokenizes `text` using the OSB scheme, returning a deduplicated,
/// hash-ordered token tree (spec §4.6: "The output is a tree keyed by token
/// hash so that duplicates collapse").
pub fn tokenize_osb(text: &str) -> Vec<Token> {
    let lowercase = text.to_lowercase();
    let words = words(&lowercase);
    let mut tree: BTreeMap<u64, u32> = BTreeMap::new();

    for (i, word) in words.iter().enumerate() {
        // Unigram feature: the word alone.
        *tree.entry(fnv1a(word.as_bytes())).or_insert(0) += 1;

        for distance in 1..=OSB_WINDOW {
            if i < distance {
                break;
            }
            let prior = words[i - distance];
            let mut combined = Vec::with_capacity(prior.len() + word.len() + 2);
            combined.extend_from_slice(prior.as_bytes());
            combined.push(b'\0');
            combined.extend_from_slice(&(distance as u32).to_le_bytes());
            combined.push(b'\0');
            combined.extend_from_slice(word.as_bytes());
            *tree.entry(fnv1a(&combined)).or_insert(0) += 1;
        }
    }

    tree.into_iter().map(|(hash, count)| Token { hash, count }).collect()
}

/// Merges several part tokenizations (body parts, subject) into one tree,
/// summing counts for tokens shared across parts.
pub fn merge_tokens(parts: impl IntoIterator<Item = Vec<Token>>) -> Vec<Token> {
    let mut tree: BTreeMap<u64, u32> = BTreeMap::new();
    for part in parts {
        for token in part {
            *tree.entry(token.hash).or_insert(0) += token.count;
        }
    }
    tree.into_iter().map(|(hash, count)| Token { hash, count }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_yields_identical_tokens() {
        let a = tokenize_osb("the quick brown fox");
        let b = tokenize_osb("the quick brown fox");
        assert_eq!(a, b);
    }

    #[test]
    fn repeated_words_collapse_into_one_token_with_count() {
        let tokens = tokenize_osb("spam spam spam");
        // One unigram hash for "spam"; higher count than a single mention.
        let spam_hash = fnv1a(b"spam");
        let found = tokens.iter().find(|t| t.hash == spam_hash).unwrap();
        assert_eq!(found.count, 3);
    }

    #[test]
    fn empty_text_has_no_tokens() {
        assert!(tokenize_osb("   ").is_empty());
    }

    #[test]
    fn merge_sums_shared_token_counts() {
        let a = tokenize_osb("hello world");
        let b = tokenize_osb("hello world");
        let merged = merge_tokens(vec![a.clone(), b]);
        let hello_hash = fnv1a(b"hello");
        let merged_count = merged.iter().find(|t| t.hash == hello_hash).unwrap().count;
        let single_count = a.iter().find(|t| t.hash == hello_hash).unwrap().count;
        assert_eq!(merged_count, single_count * 2);
    }
}
