use std::collections::HashMap;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;

/// Number of letters in every secret word and every guess.
pub const WORD_LENGTH: usize = 5;

/// Maximum number of guesses a player gets before their session ends.
pub const MAX_GUESSES: usize = 6;

/// Status of a single letter within a scored guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LetterStatus {
    /// The letter has not been scored yet.
    Unknown = 0,
    /// The letter is not in the secret word.
    Incorrect = 1,
    /// The letter is in the secret word but in the wrong position.
    Exists = 2,
    /// The letter is in the secret word and in the correct position.
    Correct = 3,
}

/// A single guess: its uppercase text, the time it was played and the
/// per-letter statuses produced by scoring it against the secret.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Word {
    pub text: String,
    pub played_at: Option<DateTime<Utc>>,
    pub stats: Vec<LetterStatus>,
}

impl Word {
    /// Builds an unscored word. Text is normalized to uppercase.
    pub fn new(text: &str) -> Self {
        let text = text.to_uppercase();
        let stats = vec![LetterStatus::Unknown; text.chars().count()];
        Word {
            text,
            played_at: None,
            stats,
        }
    }

    /// Rebuilds a word from storage with its original play time. The caller
    /// re-scores it against the secret before handing it out.
    pub fn replayed(text: &str, played_at: Option<DateTime<Utc>>) -> Self {
        let mut w = Word::new(text);
        w.played_at = played_at;
        w
    }

    /// Scores this word against `secret`, setting `stats`.
    ///
    /// Two passes: exact positions first, then leftovers against a multiset of
    /// the secret's letters, so repeated letters are never over-counted. A
    /// length mismatch scores every letter `Incorrect`.
    pub fn check(&mut self, secret: &Word) -> &[LetterStatus] {
        let guess: Vec<char> = self.text.chars().collect();
        let correct: Vec<char> = secret.text.chars().collect();

        let mut stats = vec![LetterStatus::Incorrect; guess.len()];
        if guess.len() != correct.len() {
            self.stats = stats;
            return &self.stats;
        }

        let mut remaining: HashMap<char, usize> = HashMap::new();
        for &c in &correct {
            *remaining.entry(c).or_insert(0) += 1;
        }

        for (i, &c) in guess.iter().enumerate() {
            if c == correct[i] {
                stats[i] = LetterStatus::Correct;
                if let Some(cnt) = remaining.get_mut(&c) {
                    *cnt -= 1;
                }
            }
        }

        for (i, &c) in guess.iter().enumerate() {
            if stats[i] == LetterStatus::Correct {
                continue;
            }
            if let Some(cnt) = remaining.get_mut(&c) {
                if *cnt > 0 {
                    stats[i] = LetterStatus::Exists;
                    *cnt -= 1;
                }
            }
        }

        self.stats = stats;
        &self.stats
    }

    /// True when the word is non-empty and every letter scored `Correct`.
    pub fn correct(&self) -> bool {
        if self.text.is_empty() || self.stats.is_empty() {
            return false;
        }
        self.stats.iter().all(|&s| s == LetterStatus::Correct)
    }

    /// Counts of (`Correct`, `Exists`) letters.
    fn group(&self) -> (usize, usize) {
        let mut correct = 0;
        let mut exists = 0;
        for s in &self.stats {
            match s {
                LetterStatus::Correct => correct += 1,
                LetterStatus::Exists => exists += 1,
                _ => {}
            }
        }
        (correct, exists)
    }

    /// True when this word ranks strictly higher than `other`: more correct
    /// letters, then more existing letters, then the earlier play time wins.
    /// A word that was never played loses every tiebreak.
    pub fn outranks(&self, other: &Word) -> bool {
        let (self_correct, self_exists) = self.group();
        let (other_correct, other_exists) = other.group();

        if self_correct != other_correct {
            return self_correct > other_correct;
        }
        if self_exists != other_exists {
            return self_exists > other_exists;
        }

        match (self.played_at, other.played_at) {
            (Some(mine), Some(theirs)) => mine < theirs,
            _ => false,
        }
    }

    /// Statuses as wire integers.
    pub fn stat_ints(&self) -> Vec<u8> {
        self.stats.iter().map(|&s| s as u8).collect()
    }
}

/// Source of secret words and the dictionary that validates guesses.
pub trait WordSource: Send + Sync {
    /// Picks a fresh secret word.
    fn generate(&self) -> String;
    /// True when `text` is a playable dictionary word.
    fn validate(&self, text: &str) -> bool;
}

/// Dictionary backed by the word list embedded at build time.
pub struct LocalWords {
    words: Vec<String>,
    index: HashSet<String>,
}

const WORD_FILE: &str = include_str!("../resources/five_letter_words.txt");

impl LocalWords {
    pub fn new() -> Self {
        let words: Vec<String> = WORD_FILE
            .lines()
            .map(|l| l.trim().to_uppercase())
            .filter(|l| l.chars().count() == WORD_LENGTH)
            .collect();
        let index = words.iter().cloned().collect();
        LocalWords { words, index }
    }
}

impl Default for LocalWords {
    fn default() -> Self {
        Self::new()
    }
}

impl WordSource for LocalWords {
    fn generate(&self) -> String {
        let mut rng = rand::rng();
        self.words
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| "GAMES".to_string())
    }

    fn validate(&self, text: &str) -> bool {
        self.index.contains(&text.to_uppercase())
    }
}
