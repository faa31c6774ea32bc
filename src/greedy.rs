use log::debug;
use std::collections::HashSet;

use crate::spotter::Token;
use crate::topk::arg_max;
use crate::vocab::Keyword;

/// Greedy (best path) keyword search.
///
/// Each frame contributes its arg-max token. Keyword tokens are appended to
/// the running hypothesis once per uninterrupted run; a blank or a token
/// outside the keyword ends the run.
#[derive(Debug, Default)]
pub struct GreedySearch {
    blank_id: usize,
    hyps: Vec<Token>,
    seen: HashSet<usize>,
}

impl GreedySearch {
    pub fn new(blank_id: usize) -> Self {
        Self {
            blank_id,
            ..Self::default()
        }
    }

    pub fn search(&mut self, offset: usize, probs: &[Vec<f32>], keyword: &Keyword) {
        for (i, prob) in probs.iter().enumerate() {
            let Some((id, prob)) = arg_max(prob) else {
                continue;
            };
            let time_step = offset + i;
            debug!("frame {time_step:>3} max index {id:>4} prob {prob:.3}");

            if id != self.blank_id && keyword.contains(id) {
                // Repeats within a run only count once; their prob is not updated.
                if self.seen.insert(id) {
                    self.hyps.push(Token { time_step, id, prob });
                    if self.hyps.len() > keyword.len() {
                        self.hyps.remove(0);
                    }
                }
            } else {
                self.seen.clear();
            }
        }
    }

    pub fn hypothesis(&self) -> &[Token] {
        &self.hyps
    }

    /// The hypothesis tokens when they spell the keyword.
    pub fn matched(&self, keyword: &Keyword) -> Option<&[Token]> {
        let matches = !keyword.is_empty()
            && self.hyps.len() == keyword.len()
            && self
                .hyps
                .iter()
                .zip(keyword.tokens())
                .all(|(token, &id)| token.id == id);
        matches.then_some(self.hyps.as_slice())
    }

    pub fn reset(&mut self) {
        self.hyps.clear();
        self.seen.clear();
    }
}
