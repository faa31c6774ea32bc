use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Token table of a CTC model.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    tokens: HashMap<String, usize>,
    max_token_chars: usize,
}

impl Vocabulary {
    /// Load a `<token> <1-based index>` file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Parse vocabulary lines. Malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut vocab = Self::default();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(token), Some(index)) = (fields.next(), fields.next()) else {
                continue;
            };
            match index.parse::<usize>() {
                Ok(index) if index > 0 => vocab.insert(token, index - 1),
                _ => debug!("skipping vocabulary line {line:?}"),
            }
        }
        vocab
    }

    pub fn insert(&mut self, token: &str, id: usize) {
        self.max_token_chars = self.max_token_chars.max(token.chars().count());
        self.tokens.insert(token.to_string(), id);
    }

    pub fn id(&self, token: &str) -> Option<usize> {
        self.tokens.get(token).copied()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Split `text` into vocabulary tokens, longest match first.
    ///
    /// Whitespace is ignored. Characters no token covers are logged and
    /// dropped.
    pub fn tokenize(&self, text: &str) -> Vec<usize> {
        let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
        let mut ids = Vec::new();
        let mut pos = 0;
        while pos < chars.len() {
            let longest = self.max_token_chars.min(chars.len() - pos);
            let found = (1..=longest).rev().find_map(|len| {
                let piece: String = chars[pos..pos + len].iter().collect();
                self.id(&piece).map(|id| (id, len))
            });
            match found {
                Some((id, len)) => {
                    ids.push(id);
                    pos += len;
                }
                None => {
                    warn!("cannot find {:?} of keyword {text:?} in vocabulary", chars[pos]);
                    pos += 1;
                }
            }
        }
        ids
    }

    pub fn keyword(&self, text: &str, blank_id: usize) -> Keyword {
        Keyword::new(text, self.tokenize(text), blank_id)
    }
}

/// The keyword to spot, as vocabulary ids.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Keyword {
    text: String,
    tokens: Vec<usize>,
    /// Token ids plus the blank.
    token_set: HashSet<usize>,
}

impl Keyword {
    pub fn new(text: &str, tokens: Vec<usize>, blank_id: usize) -> Self {
        let mut token_set: HashSet<usize> = tokens.iter().copied().collect();
        token_set.insert(blank_id);
        Self {
            text: text.to_string(),
            tokens,
            token_set,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tokens(&self) -> &[usize] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Membership in the keyword set, which always holds the blank.
    pub fn contains(&self, id: usize) -> bool {
        self.token_set.contains(&id)
    }

    /// Whether candidate tokens should be restricted to the keyword set.
    pub fn filters(&self) -> bool {
        !self.token_set.is_empty()
    }
}

/// Load one keyword literal per line, as used by max-pooling models whose
/// outputs are per-keyword posteriors.
pub fn load_keyword_list(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
