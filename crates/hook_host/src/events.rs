//! Event kinds raised by the host's interception points.

use crate::world::EntityId;
use compact_str::CompactString;
use hook_bridge::{CancelPolicy, EventKind, Outcome, SubjectId, Verdict};

/// A player is about to move an item between two inventory slots.
///
/// Decision required, may suspend. Replayed through the flag guard.
#[derive(Debug, Clone)]
pub struct MoveItem {
    pub item: CompactString,
    pub from_slot: usize,
    pub to_slot: usize,
}

impl EventKind for MoveItem {
    const NAME: &'static str = "inventory:move_item";
    const CANCEL_POLICY: CancelPolicy = CancelPolicy::Terminal;
    type Outcome = Verdict;
}

/// A connecting player asks to join.
///
/// Clients retry while waiting, so this kind is declared with a pending guard.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub name: CompactString,
    pub attempt: u32,
}

impl EventKind for Handshake {
    const NAME: &'static str = "session:handshake";
    type Outcome = Verdict;
}

/// Damage is about to be applied to a player.
///
/// Decided synchronously; listeners may lower the amount or cancel the hit.
#[derive(Debug, Clone)]
pub struct DamageApplied {
    pub attacker: Option<SubjectId>,
    pub raw: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DamageOutcome {
    pub verdict: Verdict,
    pub amount: u32,
}

impl Outcome for DamageOutcome {
    fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    fn verdict_mut(&mut self) -> &mut Verdict {
        &mut self.verdict
    }
}

impl EventKind for DamageApplied {
    const NAME: &'static str = "combat:damage_applied";
    const CANCEL_POLICY: CancelPolicy = CancelPolicy::Terminal;
    type Outcome = DamageOutcome;
}

/// An entity was destroyed. Informational, raised after the fact.
#[derive(Debug, Clone)]
pub struct EntityDestroyed {
    pub entity: EntityId,
    pub kind: CompactString,
}

impl EventKind for EntityDestroyed {
    const NAME: &'static str = "world:entity_destroyed";
    type Outcome = Verdict;
}
