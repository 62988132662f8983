use crate::compiler::{self, Generation, NO_CHAIN_ENTRY};
use crate::counters::CounterCache;
use crate::error::{Error, Result};
use crate::firewall::Shared;
use crate::module::{Counter, EntryPoint, ModuleKind};
use crate::registry::Programs;
use crate::rule::{Action, Direction, MatchFields, Rule};
use log::{debug, error, info};
use std::time::Instant;
use zon_fw_common::MAX_RULES;

/// Rules, counters and compiled pipeline of one traffic direction.
///
/// The rule id is also its position in the chain: slot `i` holds either
/// nothing or the rule with id `i`.
pub struct Chain {
    direction: Direction,
    rules: Vec<Option<Rule>>,
    counters: CounterCache,
    default_action: Action,
    /// Selects the positions range of the next generation.
    slot: u32,
    generation: Option<Generation>,
    /// The rules changed since the last installed generation.
    dirty: bool,
    /// Rule ids below this value still match the positions counted by the
    /// live generation. Removing a rule shifts the ids above it, their live
    /// counters can't be read until the next generation is installed.
    live_valid_below: u32,
}

impl Chain {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            rules: vec![],
            counters: CounterCache::new(),
            default_action: Action::default(),
            slot: 0,
            generation: None,
            dirty: false,
            live_valid_below: u32::MAX,
        }
    }

    /// Number of slots including the empty ones.
    pub fn nr_rules(&self) -> u32 {
        self.rules.len() as u32
    }

    pub fn default_action(&self) -> Action {
        self.default_action
    }

    pub fn generation(&self) -> Option<&Generation> {
        self.generation.as_ref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn entry(&self) -> EntryPoint {
        self.generation
            .as_ref()
            .map_or(NO_CHAIN_ENTRY, |g| g.entry)
    }

    /// Present rules only.
    pub fn present(&self) -> Vec<&Rule> {
        self.rules.iter().flatten().collect()
    }

    pub fn get(&self, id: u32) -> Result<&Rule> {
        self.rules
            .get(id as usize)
            .and_then(|r| r.as_ref())
            .ok_or(Error::NotFound(id))
    }

    /// Present rules followed by the default policy, listed with the id
    /// right after the last rule slot.
    pub fn list(&self) -> Vec<Rule> {
        let mut rules = self.present().into_iter().cloned().collect::<Vec<_>>();
        rules.push(
            Rule::new(self.nr_rules(), MatchFields::default(), self.default_action)
                .with_description("Default Policy"),
        );
        rules
    }

    pub fn append(
        &mut self,
        fw: &Shared,
        fields: MatchFields,
        action: Option<Action>,
        description: &str,
    ) -> Result<u32> {
        let id = self.nr_rules();
        let rule =
            Rule::new(id, fields, action.unwrap_or(Action::Drop)).with_description(description);
        self.insert(fw, rule)?;
        Ok(id)
    }

    /// Places `rule` at the position given by its id, growing the chain if
    /// needed. An existing rule is overwritten.
    pub fn insert(&mut self, fw: &Shared, rule: Rule) -> Result<()> {
        let id = rule.id;
        if id >= MAX_RULES {
            return Err(Error::InvalidRule(format!(
                "id {} exceeds the max {} rules",
                id, MAX_RULES
            )));
        }

        self.reconcile_all(fw)?;

        let idx = id as usize;
        if self.rules.len() <= idx {
            self.rules.resize(idx + 1, None);
            self.counters.resize(idx + 1);
        }
        if self.rules[idx].is_some() {
            info!("[{}] [{}] Rule {} overwritten!", fw.name(), self.direction, id);
        }
        self.rules[idx] = Some(rule);
        self.mutated(fw)
    }

    /// Overwrites the existing rule `id`.
    pub fn replace(
        &mut self,
        fw: &Shared,
        id: u32,
        fields: MatchFields,
        action: Action,
        description: &str,
    ) -> Result<()> {
        self.get(id)?;
        self.reconcile_all(fw)?;
        self.rules[id as usize] = Some(Rule::new(id, fields, action).with_description(description));
        self.mutated(fw)
    }

    /// Removes rule `id`, the following rules and their counters move down
    /// one position.
    pub fn remove(&mut self, fw: &Shared, id: u32) -> Result<()> {
        self.get(id)?;
        self.reconcile_all(fw)?;

        self.rules.remove(id as usize);
        self.counters.remove(id);
        for (idx, rule) in self.rules.iter_mut().enumerate().skip(id as usize) {
            if let Some(rule) = rule {
                rule.id = idx as u32;
            }
        }
        self.live_valid_below = self.live_valid_below.min(id);
        self.mutated(fw)
    }

    pub fn clear(&mut self, fw: &Shared) -> Result<()> {
        self.rules.clear();
        self.counters.clear_rules();
        self.live_valid_below = 0;
        self.mutated(fw)
    }

    fn mutated(&mut self, fw: &Shared) -> Result<()> {
        debug_assert_eq!(self.rules.len(), self.counters.len());
        self.dirty = true;
        if fw.is_interactive() {
            self.apply_rules(fw)
        } else {
            Ok(())
        }
    }

    /// Updates the shared default action module, the pipeline is left as is.
    pub fn set_default_action(&mut self, fw: &Shared, action: Action) -> Result<()> {
        if self.default_action == action {
            debug!(
                "[{}] [{}] Default action already set",
                fw.name(),
                self.direction
            );
            return Ok(());
        }

        let mut programs = fw.programs()?;
        let module = programs.shared_mut(ModuleKind::DefaultAction)?;
        let result = module
            .update_default(self.direction, action)
            .and_then(|_| module.reload());
        match result {
            Ok(()) => {
                self.default_action = action;
                debug!(
                    "[{}] [{}] Default action set to {}",
                    fw.name(),
                    self.direction,
                    action
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    "[{}] [{}] Can't reload the code for default action, {}",
                    fw.name(),
                    self.direction,
                    e
                );
                // Don't leave the rejected action staged for the next reload
                if let Err(e) = module
                    .update_default(self.direction, self.default_action)
                    .and_then(|_| module.reload())
                {
                    error!(
                        "[{}] [{}] Can't restore the default action {}, {}",
                        fw.name(),
                        self.direction,
                        self.default_action,
                        e
                    );
                }
                Err(e)
            }
        }
    }

    /// Compiles the rules unless the installed generation is current.
    pub fn apply_rules(&mut self, fw: &Shared) -> Result<()> {
        if !self.dirty && self.generation.is_some() {
            debug!(
                "[{}] [{}] Chain already up to date",
                fw.name(),
                self.direction
            );
            return Ok(());
        }
        self.update_chain(fw)
    }

    fn update_chain(&mut self, fw: &Shared) -> Result<()> {
        info!(
            "[{}] Starting to update the {} chain for {} rules...",
            fw.name(),
            self.direction,
            self.rules.len()
        );
        let start = Instant::now();

        // Held for the whole swap, the forwarder and parser are shared
        // with the other chain.
        let mut programs = fw.programs()?;

        // Last chance to read the counters of the generation going away.
        self.reconcile_live(&mut programs)?;

        let rules = self.rules.iter().flatten().collect::<Vec<_>>();
        if rules.iter().any(|r| r.fields.conntrack.is_some()) && !fw.is_conntrack_active() {
            error!(
                "[{}] Conntrack is not active, please remember to activate it.",
                fw.name()
            );
        }

        let pipeline = compiler::build(fw.dataplane(), self.direction, self.slot, &rules)?;
        let generation =
            compiler::install(&mut programs, pipeline, self.slot, rules.len(), self.entry())?;

        self.generation = Some(generation);
        self.slot ^= 1;
        self.dirty = false;
        self.live_valid_below = u32::MAX;

        info!(
            "[{}] Rules for the {} chain have been updated in {:?}!",
            fw.name(),
            self.direction,
            start.elapsed()
        );
        Ok(())
    }

    /// Adds the live counters of every present rule to the cache.
    fn reconcile_all(&mut self, fw: &Shared) -> Result<()> {
        let mut programs = fw.programs()?;
        self.reconcile_live(&mut programs)
    }

    fn reconcile_live(&mut self, programs: &mut Programs) -> Result<()> {
        let ids = self.present().iter().map(|r| r.id).collect::<Vec<_>>();
        for id in ids {
            self.reconcile(programs, id)?;
        }
        Ok(())
    }

    fn reconcile(&mut self, programs: &mut Programs, id: u32) -> Result<Counter> {
        let live = match programs.chain_mut(ModuleKind::Action, self.direction) {
            Some(action) if id < self.live_valid_below => action.fetch_counters(id)?,
            _ => Counter::default(),
        };
        Ok(self.counters.reconcile(id, live))
    }

    /// Cumulative counters of rule `id`.
    pub fn counters(&mut self, fw: &Shared, id: u32) -> Result<Counter> {
        if id >= self.nr_rules() {
            return Err(Error::invalid_state(format!(
                "no counters for rule {}, the chain has {} rules",
                id,
                self.nr_rules()
            )));
        }
        self.get(id)?;
        let mut programs = fw.programs()?;
        self.reconcile(&mut programs, id)
    }

    /// Counters of every present rule and, last, the default action ones
    /// with id equal to the number of rules.
    pub fn all_counters(&mut self, fw: &Shared) -> Result<Vec<(u32, Counter)>> {
        let mut programs = fw.programs()?;
        let ids = self.present().iter().map(|r| r.id).collect::<Vec<_>>();
        let mut all = Vec::with_capacity(ids.len() + 1);
        for id in ids {
            all.push((id, self.reconcile(&mut programs, id)?));
        }
        let live = programs
            .shared_mut(ModuleKind::DefaultAction)?
            .fetch_default_counters(self.direction)?;
        all.push((self.nr_rules(), self.counters.reconcile_default(live)));
        Ok(all)
    }

    pub fn reset_counters(&mut self, fw: &Shared) -> Result<()> {
        let mut programs = fw.programs()?;
        let ids = self.present().iter().map(|r| r.id).collect::<Vec<_>>();
        let action = programs
            .chain_mut(ModuleKind::Action, self.direction)
            .ok_or_else(|| Error::invalid_state("no action loaded yet"))?;
        for id in ids {
            action.flush_counters(id)?;
        }
        programs
            .shared_mut(ModuleKind::DefaultAction)?
            .flush_default_counters(self.direction)?;
        self.counters.reset();
        debug_assert_eq!(self.rules.len(), self.counters.len());
        Ok(())
    }
}
