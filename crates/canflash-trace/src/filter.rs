//! Block/pass message filters

use serde::{Deserialize, Serialize};

use canflash_core::CanFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Matching frames are dropped
    Block,
    /// When any pass rule exists, only matching frames are kept
    Pass,
}

/// Identifier range rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub mode: FilterMode,
    pub id_start: u32,
    pub id_end: u32,
    #[serde(default)]
    pub extended: bool,
}

impl FilterRule {
    pub fn block(id_start: u32, id_end: u32) -> Self {
        Self {
            mode: FilterMode::Block,
            id_start,
            id_end,
            extended: false,
        }
    }

    pub fn pass(id_start: u32, id_end: u32) -> Self {
        Self {
            mode: FilterMode::Pass,
            id_start,
            id_end,
            extended: false,
        }
    }

    pub fn extended(mut self) -> Self {
        self.extended = true;
        self
    }

    pub fn matches(&self, frame: &CanFrame) -> bool {
        frame.extended == self.extended && (self.id_start..=self.id_end).contains(&frame.id)
    }
}

/// Ordered rule set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFilter {
    rules: Vec<FilterRule>,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: FilterRule) {
        self.rules.push(rule);
    }

    /// Remove every rule equal to `rule`; returns whether one existed
    pub fn remove(&mut self, rule: &FilterRule) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r != rule);
        before != self.rules.len()
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// Whether the frame is relevant
    pub fn accepts(&self, frame: &CanFrame) -> bool {
        let blocks = self
            .rules
            .iter()
            .filter(|r| r.mode == FilterMode::Block)
            .any(|r| r.matches(frame));
        if blocks {
            return false;
        }

        let mut passes = self.rules.iter().filter(|r| r.mode == FilterMode::Pass).peekable();
        if passes.peek().is_none() {
            return true;
        }
        passes.any(|r| r.matches(frame))
    }
}
