use error_stack::Report;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::error;

use crate::dali_manager::{DaliManager, DaliManagerError, Result};
use crate::group::Group;
use crate::lamp::Lamp;
use crate::outbox::Outbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Lamp(u8),
    Group(u8),
}

/// Flat table of everything discovered on the bus. Lamps and groups
/// reference each other by address through this arena, so a lamp can
/// belong to many groups without ownership cycles. Rebuilt wholesale on
/// every scan.
#[derive(Default)]
pub struct DeviceTable {
    pub lamps: BTreeMap<u8, Lamp>,
    pub groups: BTreeMap<u8, Group>,
    slugs: HashMap<String, Target>,
}

impl DeviceTable {
    pub fn new() -> DeviceTable {
        DeviceTable::default()
    }

    pub fn insert_lamp(&mut self, lamp: Lamp) {
        self.slugs
            .insert(lamp.device_name.clone(), Target::Lamp(lamp.short_address));
        self.lamps.insert(lamp.short_address, lamp);
    }

    pub fn insert_group(&mut self, group: Group) {
        self.slugs
            .insert(group.device_name.clone(), Target::Group(group.address));
        for member in group.lamps.clone() {
            if let Some(lamp) = self.lamps.get_mut(&member) {
                lamp.add_group(group.address);
            }
        }
        self.groups.insert(group.address, group);
    }

    pub fn resolve(&self, slug: &str) -> Option<Target> {
        self.slugs.get(slug).copied()
    }

    pub fn has_slug(&self, slug: &str) -> bool {
        self.slugs.contains_key(slug)
    }

    pub fn lamp_count(&self) -> usize {
        self.lamps.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn set_level(
        &mut self,
        dali: &mut DaliManager,
        outbox: &mut Outbox,
        target: Target,
        level: u8,
    ) -> Result<()> {
        match target {
            Target::Lamp(address) => self.set_lamp_level(dali, outbox, address, level),
            Target::Group(address) => self.set_group_level(dali, outbox, address, level),
        }
    }

    /// Directly addressed lamp set: after a confirmed write, every group
    /// the lamp belongs to recomputes its derived level.
    fn set_lamp_level(
        &mut self,
        dali: &mut DaliManager,
        outbox: &mut Outbox,
        address: u8,
        level: u8,
    ) -> Result<()> {
        let Self { lamps, groups, .. } = self;

        let changed = match lamps.get_mut(&address) {
            Some(lamp) => lamp.set_level(dali, outbox, level)?,
            None => return Err(Report::new(DaliManagerError::ShortAddress(address))),
        };

        if changed {
            let owners: Vec<u8> = lamps
                .get(&address)
                .map(|lamp| lamp.groups.clone())
                .unwrap_or_default();
            for owner in owners {
                if let Some(group) = groups.get_mut(&owner) {
                    group.recalc_level(lamps, outbox);
                }
            }
        }

        Ok(())
    }

    /// Group set: one broadcast write, then each member's cache is updated
    /// without further bus traffic, then every *other* group touched by
    /// those members is reconciled once (flat set, no recursion).
    fn set_group_level(
        &mut self,
        dali: &mut DaliManager,
        outbox: &mut Outbox,
        address: u8,
        level: u8,
    ) -> Result<()> {
        let Self { lamps, groups, .. } = self;

        let (old, members) = match groups.get_mut(&address) {
            Some(group) => {
                group.send_level_dali(dali, level)?;
                (group.commit_level(level), group.lamps.clone())
            }
            None => return Err(Report::new(DaliManagerError::GroupAddress(address))),
        };

        let mut affected = BTreeSet::new();
        for member in &members {
            if let Some(lamp) = lamps.get_mut(member) {
                lamp.set_level_cached(outbox, level);
                affected.extend(lamp.groups.iter().copied().filter(|g| *g != address));
            }
        }

        for sibling in affected {
            if let Some(group) = groups.get_mut(&sibling) {
                group.recalc_level(lamps, outbox);
            }
        }

        if let Some(group) = groups.get_mut(&address) {
            group.publish_level(outbox, old);
        }

        Ok(())
    }

    /// Periodic reconciliation: re-query every lamp, then recompute every
    /// group that contained a lamp whose level had drifted.
    pub fn poll_all(&mut self, dali: &mut DaliManager, outbox: &mut Outbox) {
        let Self { lamps, groups, .. } = self;

        let mut affected = BTreeSet::new();
        for (address, lamp) in lamps.iter_mut() {
            match lamp.poll(dali, outbox) {
                Ok(true) => affected.extend(lamp.groups.iter().copied()),
                Ok(false) => {}
                Err(e) => error!("Polling lamp {}: {:?}", address, e),
            }
        }

        for group_address in affected {
            if let Some(group) = groups.get_mut(&group_address) {
                group.recalc_level(lamps, outbox);
            }
        }
    }
}
