//! CTC prefix beam search restricted to a single keyword.
//!
//! See <https://distill.pub/2017/ctc/> for the general algorithm. Scores are
//! probabilities rather than log probabilities, and only prefixes that could
//! still grow into the keyword are kept.

use log::debug;
use std::collections::HashMap;

use crate::spotter::Token;
use crate::topk::top_k;
use crate::vocab::Keyword;
use crate::{BLANK_ID, FIRST_BEAM_SIZE, MIN_TOKEN_PROB, SECOND_BEAM_SIZE};

const SCORE_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtcPrefixBeamSearchOptions {
    pub blank: usize,
    /// Tokens considered per frame.
    pub first_beam_size: usize,
    /// Prefixes kept per frame.
    pub second_beam_size: usize,
}

impl Default for CtcPrefixBeamSearchOptions {
    fn default() -> Self {
        Self {
            blank: BLANK_ID,
            first_beam_size: FIRST_BEAM_SIZE,
            second_beam_size: SECOND_BEAM_SIZE,
        }
    }
}

/// Score of one prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefixScore {
    /// Ending in blank.
    pub s: f32,
    /// Ending in the last token of the prefix.
    pub ns: f32,
    /// Where each prefix token was emitted, with its best prob.
    pub nodes: Vec<Token>,
}

impl PrefixScore {
    fn empty_prefix() -> Self {
        Self {
            s: 1.0,
            ns: 0.0,
            nodes: Vec::new(),
        }
    }

    pub fn total_score(&self) -> f32 {
        self.s + self.ns
    }

    /// Product of the token probs along the prefix.
    pub fn hit_score(&self) -> f32 {
        self.nodes.iter().map(|node| node.prob).product()
    }
}

pub type Prefix = Vec<usize>;

/// Prefix table that iterates in insertion order.
#[derive(Default)]
struct PrefixTable {
    entries: Vec<(Prefix, PrefixScore)>,
    index: HashMap<Prefix, usize>,
}

impl PrefixTable {
    fn entry(&mut self, prefix: Prefix) -> &mut PrefixScore {
        let slot = match self.index.get(&prefix) {
            Some(&slot) => slot,
            None => {
                let slot = self.entries.len();
                self.index.insert(prefix.clone(), slot);
                self.entries.push((prefix, PrefixScore::default()));
                slot
            }
        };
        &mut self.entries[slot].1
    }

    fn into_entries(self) -> Vec<(Prefix, PrefixScore)> {
        self.entries
    }
}

pub struct CtcPrefixBeamSearch {
    options: CtcPrefixBeamSearchOptions,
    /// Current hypotheses, best first.
    hyps: Vec<(Prefix, PrefixScore)>,
    time_step: usize,
}

impl CtcPrefixBeamSearch {
    pub fn new(options: CtcPrefixBeamSearchOptions) -> Self {
        let mut search = Self {
            options,
            hyps: Vec::new(),
            time_step: 0,
        };
        search.reset();
        search
    }

    pub fn options(&self) -> &CtcPrefixBeamSearchOptions {
        &self.options
    }

    pub fn hypotheses(&self) -> &[(Prefix, PrefixScore)] {
        &self.hyps
    }

    /// Time step the next frame will get.
    pub fn time_step(&self) -> usize {
        self.time_step
    }

    pub fn clear_time_step(&mut self) {
        self.time_step = 0;
    }

    /// Drop all hypotheses but the empty prefix.
    pub fn reset(&mut self) {
        self.hyps.clear();
        self.hyps.push((Vec::new(), PrefixScore::empty_prefix()));
    }

    pub fn search(&mut self, probs: &[Vec<f32>], keyword: &Keyword) {
        for prob in probs {
            self.step(prob, keyword);
        }
    }

    /// Advance the beam by one frame of token probabilities.
    pub fn step(&mut self, prob: &[f32], keyword: &Keyword) {
        if prob.is_empty() {
            return;
        }
        let time_step = self.time_step;
        self.time_step += 1;

        let candidates: Vec<(usize, f32)> = top_k(prob, self.options.first_beam_size)
            .into_iter()
            .filter(|&(id, p)| p > MIN_TOKEN_PROB && (!keyword.filters() || keyword.contains(id)))
            .collect();
        if candidates.is_empty() {
            return;
        }

        let blank = self.options.blank;
        let mut next = PrefixTable::default();
        for &(id, ps) in &candidates {
            debug!("step {time_step:>3} token {id:>4} prob {ps:.3}");
            for (prefix, score) in &self.hyps {
                if id == blank {
                    let next_score = next.entry(prefix.clone());
                    next_score.s += score.s * ps + score.ns * ps;
                    next_score.nodes = score.nodes.clone();
                } else if prefix.last() == Some(&id) {
                    if score.ns.abs() > SCORE_EPSILON {
                        // a a -> a
                        let mut nodes = score.nodes.clone();
                        if let Some(last) = nodes.last_mut() {
                            if ps > last.prob {
                                last.prob = ps;
                                last.time_step = time_step;
                            }
                        }
                        let next_score = next.entry(prefix.clone());
                        next_score.ns += score.ns * ps;
                        next_score.nodes = nodes;
                    }
                    if score.s.abs() > SCORE_EPSILON {
                        // a - a -> a a
                        let mut next_prefix = prefix.clone();
                        next_prefix.push(id);
                        let mut nodes = score.nodes.clone();
                        nodes.push(Token { time_step, id, prob: ps });
                        let next_score = next.entry(next_prefix);
                        next_score.ns += score.s * ps;
                        next_score.nodes = nodes;
                    }
                } else {
                    let mut next_prefix = prefix.clone();
                    next_prefix.push(id);
                    let token = Token { time_step, id, prob: ps };
                    let next_score = next.entry(next_prefix);
                    match next_score.nodes.last().map(|last| ps > last.prob) {
                        // Keep the more confident emission instead of summing paths.
                        Some(true) => {
                            next_score.nodes.pop();
                            next_score.nodes.push(token);
                            next_score.ns = score.ns;
                            next_score.s = score.s;
                        }
                        Some(false) => {}
                        None => {
                            let mut nodes = score.nodes.clone();
                            nodes.push(token);
                            next_score.nodes = nodes;
                            next_score.ns += score.s * ps + score.ns * ps;
                        }
                    }
                }
            }
        }

        let pruned = prune(next.into_entries(), self.options.second_beam_size);
        self.update_hypotheses(pruned, keyword.len());
    }

    /// Replace the beam, dropping prefixes longer than the keyword and
    /// re-seeding the empty prefix.
    fn update_hypotheses(&mut self, pruned: Vec<(Prefix, PrefixScore)>, max_len: usize) {
        self.hyps.clear();
        let mut has_empty = false;
        for (prefix, score) in pruned {
            if prefix.is_empty() {
                has_empty = true;
                self.hyps.push((prefix, PrefixScore::empty_prefix()));
            } else if prefix.len() <= max_len {
                self.hyps.push((prefix, score));
            }
        }
        if !has_empty {
            self.hyps.truncate(self.options.second_beam_size.saturating_sub(1));
            self.hyps.push((Vec::new(), PrefixScore::empty_prefix()));
        }
    }

    /// The hypothesis spelling exactly the keyword, if any.
    pub fn find(&self, keyword: &Keyword) -> Option<&PrefixScore> {
        if keyword.is_empty() {
            return None;
        }
        self.hyps
            .iter()
            .find(|(prefix, _)| prefix.as_slice() == keyword.tokens())
            .map(|(_, score)| score)
    }
}

/// Keep the `beam` best prefixes by total score, best first.
fn prune(mut hyps: Vec<(Prefix, PrefixScore)>, beam: usize) -> Vec<(Prefix, PrefixScore)> {
    let by_score =
        |a: &(Prefix, PrefixScore), b: &(Prefix, PrefixScore)| b.1.total_score().total_cmp(&a.1.total_score());

    if hyps.len() > beam {
        hyps.select_nth_unstable_by(beam, by_score);
        hyps.truncate(beam);
    }
    hyps.sort_by(by_score);
    hyps
}
