//! # Simulated World
//!
//! The engine state the hooks guard: players with inventories and health,
//! plus loose entities. Mutation methods with a `_raw` suffix are the
//! engine's own operations; they perform no interception and are only called
//! by [`EngineHooks`](crate::adapters::EngineHooks) once a decision allows it.

use compact_str::CompactString;
use dashmap::DashMap;
use hook_bridge::SubjectId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Item every player spawns with, in slot 0.
pub const STARTER_ITEM: &str = "torch";

const STARTING_HEALTH: u32 = 100;

/// Identifier of a non-player entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemStack {
    pub item: CompactString,
    pub count: u32,
}

impl ItemStack {
    pub fn new(item: &str, count: u32) -> Self {
        Self {
            item: CompactString::new(item),
            count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Player {
    pub name: CompactString,
    pub health: u32,
    pub inventory: Vec<Option<ItemStack>>,
}

/// Errors from the engine's own operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorldError {
    #[error("No player {0}")]
    NoSuchPlayer(SubjectId),

    #[error("Player {0} is already in the world")]
    AlreadyPresent(SubjectId),

    #[error("Slot {slot} is outside an inventory of {size} slots")]
    SlotOutOfRange { slot: usize, size: usize },

    #[error("Slot {0} is empty")]
    EmptySlot(usize),

    #[error("Slot {0} is occupied")]
    SlotOccupied(usize),
}

/// Shared handle to the world. Clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct World {
    players: Arc<DashMap<SubjectId, Player>>,
    entities: Arc<DashMap<EntityId, CompactString>>,
    mutations: Arc<AtomicU64>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }

    /// Total number of successful mutations so far.
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Adds a player holding the starter item in slot 0.
    pub fn spawn_player(&self, subject: SubjectId, name: &str, inventory_size: usize) -> Result<(), WorldError> {
        if self.players.contains_key(&subject) {
            return Err(WorldError::AlreadyPresent(subject));
        }
        let mut inventory = vec![None; inventory_size.max(1)];
        inventory[0] = Some(ItemStack::new(STARTER_ITEM, 1));
        self.players.insert(
            subject,
            Player {
                name: CompactString::new(name),
                health: STARTING_HEALTH,
                inventory,
            },
        );
        self.mutated();
        Ok(())
    }

    pub fn remove_player(&self, subject: SubjectId) -> bool {
        let removed = self.players.remove(&subject).is_some();
        if removed {
            self.mutated();
        }
        removed
    }

    pub fn is_present(&self, subject: SubjectId) -> bool {
        self.players.contains_key(&subject)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn player_name(&self, subject: SubjectId) -> Option<CompactString> {
        self.players.get(&subject).map(|p| p.name.clone())
    }

    pub fn health(&self, subject: SubjectId) -> Option<u32> {
        self.players.get(&subject).map(|p| p.health)
    }

    pub fn item_in(&self, subject: SubjectId, slot: usize) -> Option<ItemStack> {
        self.players
            .get(&subject)
            .and_then(|p| p.inventory.get(slot).cloned().flatten())
    }

    /// First slot holding `item`.
    pub fn slot_of(&self, subject: SubjectId, item: &str) -> Option<usize> {
        self.players.get(&subject).and_then(|p| {
            p.inventory
                .iter()
                .position(|stack| stack.as_ref().is_some_and(|s| s.item == item))
        })
    }

    pub fn inventory_size(&self, subject: SubjectId) -> Option<usize> {
        self.players.get(&subject).map(|p| p.inventory.len())
    }

    pub fn move_item_raw(&self, subject: SubjectId, from: usize, to: usize) -> Result<(), WorldError> {
        let mut player = self
            .players
            .get_mut(&subject)
            .ok_or(WorldError::NoSuchPlayer(subject))?;
        let size = player.inventory.len();
        for slot in [from, to] {
            if slot >= size {
                return Err(WorldError::SlotOutOfRange { slot, size });
            }
        }
        if player.inventory[to].is_some() {
            return Err(WorldError::SlotOccupied(to));
        }
        let stack = player.inventory[from].take().ok_or(WorldError::EmptySlot(from))?;
        player.inventory[to] = Some(stack);
        drop(player);
        self.mutated();
        Ok(())
    }

    /// Subtracts `amount` from the player's health and returns what is left.
    pub fn apply_damage_raw(&self, subject: SubjectId, amount: u32) -> Result<u32, WorldError> {
        let mut player = self
            .players
            .get_mut(&subject)
            .ok_or(WorldError::NoSuchPlayer(subject))?;
        player.health = player.health.saturating_sub(amount);
        let remaining = player.health;
        drop(player);
        self.mutated();
        Ok(remaining)
    }

    pub fn heal_raw(&self, subject: SubjectId) -> Result<(), WorldError> {
        let mut player = self
            .players
            .get_mut(&subject)
            .ok_or(WorldError::NoSuchPlayer(subject))?;
        player.health = STARTING_HEALTH;
        drop(player);
        self.mutated();
        Ok(())
    }

    pub fn spawn_entity(&self, kind: &str) -> EntityId {
        let id = EntityId::new();
        self.entities.insert(id, CompactString::new(kind));
        self.mutated();
        id
    }

    /// Removes an entity and returns its kind.
    pub fn destroy_entity_raw(&self, entity: EntityId) -> Option<CompactString> {
        let removed = self.entities.remove(&entity).map(|(_, kind)| kind);
        if removed.is_some() {
            self.mutated();
        }
        removed
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of entities of `kind`.
    pub fn count_entities(&self, kind: &str) -> usize {
        self.entities.iter().filter(|entry| entry.value().as_str() == kind).count()
    }
}
