use std::collections::VecDeque;

use serde_json::Value;
use sha2::{Digest, Sha256};

pub const DEFAULT_LOOP_HISTORY: usize = 20;
pub const DEFAULT_LOOP_REPEAT: usize = 3;

const PATTERN_WINDOW: usize = 10;
const PATTERN_MIN_ENTRIES: usize = 6;
const PATTERN_MIN_CYCLES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
struct LoopEntry {
    name: String,
    input_hash: String,
}

/// Per-task history of tool calls used to steer a model out of repetition.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    history: VecDeque<LoopEntry>,
    max_history: usize,
    max_repeat: usize,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_LOOP_HISTORY, DEFAULT_LOOP_REPEAT)
    }
}

impl LoopDetector {
    pub fn new(max_history: usize, max_repeat: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(max_history),
            max_history: max_history.max(1),
            max_repeat: max_repeat.max(1),
        }
    }

    /// Returns a steering message when this call would repeat an earlier one.
    ///
    /// A call is a loop when it exactly repeats the previous call, or when the
    /// same signature already appears `max_repeat` times in the window.
    pub fn check(&self, name: &str, input: &Value) -> Option<String> {
        let input_hash = input_hash(input);
        let count = self
            .history
            .iter()
            .filter(|e| e.name == name && e.input_hash == input_hash)
            .count();
        let repeats_last = self
            .history
            .back()
            .is_some_and(|e| e.name == name && e.input_hash == input_hash);

        if repeats_last || count >= self.max_repeat {
            return Some(format!(
                "Tool call loop detected ({} called {} times with same input). Please try a different approach.",
                name,
                count + 1
            ));
        }
        None
    }

    pub fn record(&mut self, name: &str, input: &Value) {
        self.history.push_back(LoopEntry {
            name: name.to_string(),
            input_hash: input_hash(input),
        });
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    /// Detects cycles of distinct tools such as `read→exec→read→exec→read→exec`.
    pub fn detect_pattern(&self) -> Option<String> {
        if self.history.len() < PATTERN_MIN_ENTRIES {
            return None;
        }
        let skip = self.history.len().saturating_sub(PATTERN_WINDOW);
        let recent = self
            .history
            .iter()
            .skip(skip)
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>();

        (2..=4).find_map(|len| {
            if !has_repeating_pattern(&recent, len) {
                return None;
            }
            Some(format!(
                "Repeating tool pattern detected ({}). Consider a different strategy.",
                recent[..len].join("→")
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

fn has_repeating_pattern(names: &[&str], len: usize) -> bool {
    if names.len() < len * PATTERN_MIN_CYCLES {
        return false;
    }
    let pattern = &names[..len];
    let mut cycles = 1;
    for (i, name) in names.iter().enumerate().skip(len) {
        let idx = i % len;
        if *name != pattern[idx] {
            return false;
        }
        if idx == len - 1 {
            cycles += 1;
        }
    }
    cycles >= PATTERN_MIN_CYCLES
}

/// Hex of the first 8 bytes of the SHA-256 of the serialized input.
pub fn input_hash(input: &Value) -> String {
    let bytes = serde_json::to_vec(input).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
