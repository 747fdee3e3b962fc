//! Rule stores.
//!
//! Raw rules and their compiled caches live behind `ArcSwap`: flows take a
//! snapshot reference at flow start, writers rebuild and swap atomically.
//! All mutations are serialised through a single lock so read-modify-write
//! cannot lose updates (same discipline as config mutation).

use crate::rules::compiler::{
    compile_block_rules, compile_filter_rules, compile_rules, BlockMatchers, CompiledRules,
    FilterMatchers,
};
use crate::rules::{BlockRule, EditRule, FilterRule};
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex};

pub struct RuleStore {
    edit_rules: ArcSwap<Vec<EditRule>>,
    compiled: ArcSwap<CompiledRules>,

    block_rules: ArcSwap<Vec<BlockRule>>,
    block_matchers: ArcSwap<BlockMatchers>,

    filter_rules: ArcSwap<Vec<FilterRule>>,
    filter_matchers: ArcSwap<FilterMatchers>,

    /// Serialises all rule mutations; readers stay lock-free.
    write_mu: Mutex<()>,
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            edit_rules: ArcSwap::new(Arc::new(Vec::new())),
            compiled: ArcSwap::new(Arc::new(CompiledRules::default())),
            block_rules: ArcSwap::new(Arc::new(Vec::new())),
            block_matchers: ArcSwap::new(Arc::new(BlockMatchers::default())),
            filter_rules: ArcSwap::new(Arc::new(Vec::new())),
            filter_matchers: ArcSwap::new(Arc::new(FilterMatchers::default())),
            write_mu: Mutex::new(()),
        }
    }

    // ---- snapshots ----

    pub fn edit_rules(&self) -> Arc<Vec<EditRule>> {
        self.edit_rules.load_full()
    }

    pub fn compiled(&self) -> Arc<CompiledRules> {
        self.compiled.load_full()
    }

    pub fn block_rules(&self) -> Arc<Vec<BlockRule>> {
        self.block_rules.load_full()
    }

    pub fn block_matchers(&self) -> Arc<BlockMatchers> {
        self.block_matchers.load_full()
    }

    pub fn filter_rules(&self) -> Arc<Vec<FilterRule>> {
        self.filter_rules.load_full()
    }

    pub fn filter_matchers(&self) -> Arc<FilterMatchers> {
        self.filter_matchers.load_full()
    }

    // ---- mutations ----

    /// Read-modify-write on the edit rule list. Every entry is normalised
    /// and the compiled cache rebuilt before the swap.
    pub fn with_edit_rules<R>(&self, f: impl FnOnce(&mut Vec<EditRule>) -> R) -> R {
        let _guard = self.write_mu.lock().unwrap();
        let mut rules = (**self.edit_rules.load()).clone();
        let result = f(&mut rules);
        let rules: Vec<EditRule> = rules.into_iter().map(EditRule::normalize).collect();
        self.compiled.store(Arc::new(compile_rules(&rules)));
        self.edit_rules.store(Arc::new(rules));
        result
    }

    pub fn with_block_rules<R>(&self, f: impl FnOnce(&mut Vec<BlockRule>) -> R) -> R {
        let _guard = self.write_mu.lock().unwrap();
        let mut rules = (**self.block_rules.load()).clone();
        let result = f(&mut rules);
        let rules: Vec<BlockRule> = rules.into_iter().map(BlockRule::normalize).collect();
        self.block_matchers
            .store(Arc::new(compile_block_rules(&rules)));
        self.block_rules.store(Arc::new(rules));
        result
    }

    pub fn with_filter_rules<R>(&self, f: impl FnOnce(&mut Vec<FilterRule>) -> R) -> R {
        let _guard = self.write_mu.lock().unwrap();
        let mut rules = (**self.filter_rules.load()).clone();
        let result = f(&mut rules);
        let rules: Vec<FilterRule> = rules.into_iter().map(FilterRule::normalize).collect();
        self.filter_matchers
            .store(Arc::new(compile_filter_rules(&rules)));
        self.filter_rules.store(Arc::new(rules));
        result
    }

    /// Replace wholesale — used at startup when loading persisted files.
    pub fn load_edit_rules(&self, rules: Vec<EditRule>) {
        self.with_edit_rules(|current| *current = rules);
    }

    pub fn load_block_rules(&self, rules: Vec<BlockRule>) {
        self.with_block_rules(|current| *current = rules);
    }

    pub fn load_filter_rules(&self, rules: Vec<FilterRule>) {
        self.with_filter_rules(|current| *current = rules);
    }
}
