//! Scripted player activity.
//!
//! Deterministic per tick, so a run with the same configuration exercises
//! the same interception points in the same order: joins with retries, item
//! moves (some into locked slots, some too fast), damage (some self-inflicted),
//! crate destruction and periodic disconnects.

use crate::adapters::EngineHooks;
use crate::config::HarnessSettings;
use crate::listeners::LOOT_SOURCE;
use crate::world::STARTER_ITEM;
use compact_str::{format_compact, CompactString};
use hook_bridge::SubjectId;
use tracing::{debug, warn};

const MAX_JOIN_ATTEMPTS: u32 = 5;

#[derive(Debug)]
struct Actor {
    id: SubjectId,
    name: CompactString,
    attempts: u32,
}

/// Per-tick totals, mostly for tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub joins_requested: u32,
    pub moves_requested: u32,
    pub moves_applied: u32,
    pub damage_applied: u32,
    pub entities_destroyed: u32,
    pub disconnects: u32,
}

/// Drives the simulated players through [`EngineHooks`].
#[derive(Debug)]
pub struct Scenario {
    actors: Vec<Actor>,
    settings: HarnessSettings,
}

impl Scenario {
    /// Creates `settings.subjects` actors. When names are banned, the last
    /// actor uses the first banned name.
    pub fn new(settings: HarnessSettings) -> Self {
        let actors = (0..settings.subjects)
            .map(|i| {
                let banned = settings.banned_names.first().filter(|_| i + 1 == settings.subjects && i > 0);
                Actor {
                    id: SubjectId::new(),
                    name: match banned {
                        Some(name) => CompactString::new(name),
                        None => format_compact!("player-{i}"),
                    },
                    attempts: 0,
                }
            })
            .collect();
        Self { actors, settings }
    }

    pub fn subjects(&self) -> impl Iterator<Item = SubjectId> + '_ {
        self.actors.iter().map(|actor| actor.id)
    }

    /// Runs one tick's worth of activity. Must be called on the engine thread.
    pub fn step(&mut self, hooks: &EngineHooks, tick: u64) -> TickReport {
        let mut report = TickReport::default();
        let count = self.actors.len() as u64;
        let world = hooks.world().clone();

        if self.settings.disconnect_every_ticks > 0 && tick > 0 && tick % self.settings.disconnect_every_ticks == 0 {
            let index = ((tick / self.settings.disconnect_every_ticks) % count) as usize;
            let actor = &mut self.actors[index];
            if hooks.disconnect(actor.id) {
                report.disconnects += 1;
            }
            actor.attempts = 0;
        }

        for index in 0..self.actors.len() {
            let slot = index as u64;
            let id = self.actors[index].id;

            if !world.is_present(id) {
                let actor = &mut self.actors[index];
                if actor.attempts < MAX_JOIN_ATTEMPTS {
                    actor.attempts += 1;
                    report.joins_requested += 1;
                    hooks.handshake(id, &actor.name, actor.attempts);
                }
                continue;
            }

            if tick % 3 == slot % 3 {
                if let Some(from) = world.slot_of(id, STARTER_ITEM) {
                    let to = (from + 1 + (tick as usize % 2)) % self.settings.inventory_size;
                    report.moves_requested += 1;
                    if hooks.move_item(id, from, to) {
                        report.moves_applied += 1;
                    }
                }
            }

            if tick % 7 == slot % 7 {
                // Every other hit is self-inflicted.
                let attacker = if tick % 2 == 0 {
                    id
                } else {
                    self.actors[((slot + 1) % count) as usize].id
                };
                match hooks.apply_damage(id, Some(attacker), 8 + (tick % 5) as u32 * 4) {
                    Ok(amount) => report.damage_applied += amount,
                    Err(e) => warn!("⚠️ Damage decision for {} failed: {}", id, e),
                }
                if world.health(id) == Some(0) {
                    debug!("💀 {} fell; respawning at full health", id);
                    let _ = world.heal_raw(id);
                }
            }

            if tick % 11 == slot % 11 {
                let entity = world.spawn_entity(LOOT_SOURCE);
                if hooks.destroy_entity(entity, id) {
                    report.entities_destroyed += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_actor_takes_banned_name() {
        let scenario = Scenario::new(HarnessSettings {
            subjects: 3,
            ..HarnessSettings::default()
        });
        let names: Vec<_> = scenario.actors.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["player-0", "player-1", "griefer"]);
    }

    #[test]
    fn test_single_actor_is_never_banned() {
        let scenario = Scenario::new(HarnessSettings {
            subjects: 1,
            ..HarnessSettings::default()
        });
        assert_eq!(scenario.actors[0].name, "player-0");
        assert_eq!(scenario.subjects().count(), 1);
    }
}
