//! Listeners the host registers at startup.
//!
//! A mix of synchronous checks, which always resolve inline, and async
//! checks that simulate a permission service round-trip and therefore push
//! their decisions through the continuation bridge.

use crate::config::HarnessSettings;
use crate::events::{DamageApplied, EntityDestroyed, Handshake, MoveItem};
use crate::world::World;
use async_trait::async_trait;
use compact_str::CompactString;
use dashmap::DashMap;
use futures::FutureExt;
use hook_bridge::{
    EngineHandle, Envelope, GuardShape, KindPolicy, Listener, ListenerError, Priority, RegistryBuilder,
    RetriggerPolicy, SubjectId,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Entity kind that drops loot when destroyed.
pub const LOOT_SOURCE: &str = "crate";
/// Entity kind spawned as loot.
pub const LOOT: &str = "loot";

/// Rejects moves into locked slots, after a simulated permission lookup.
pub struct SlotPermissions {
    world: World,
    engine: EngineHandle,
    locked_slots: Vec<usize>,
    latency: Duration,
}

#[async_trait]
impl Listener<MoveItem> for SlotPermissions {
    async fn handle(&self, envelope: &mut Envelope<MoveItem>) -> Result<(), ListenerError> {
        tokio::time::sleep(self.latency).await;

        // World state is only read on the engine thread.
        let world = self.world.clone();
        let subject = envelope.subject();
        let present = self
            .engine
            .call(move || world.is_present(subject))
            .await
            .map_err(|e| ListenerError::Failed(e.to_string()))?;

        if !present {
            envelope.cancel();
        } else if self.locked_slots.contains(&envelope.event().to_slot) {
            debug!("🔒 Slot {} is locked for {}", envelope.event().to_slot, subject);
            envelope.cancel();
        }
        Ok(())
    }
}

/// Refuses handshakes from banned names.
pub struct Whitelist {
    banned: Vec<CompactString>,
    latency: Duration,
}

#[async_trait]
impl Listener<Handshake> for Whitelist {
    async fn handle(&self, envelope: &mut Envelope<Handshake>) -> Result<(), ListenerError> {
        tokio::time::sleep(self.latency).await;
        if self.banned.contains(&envelope.event().name) {
            info!("🚷 Refusing handshake from '{}'", envelope.event().name);
            envelope.cancel();
        }
        Ok(())
    }
}

/// Denies moves that follow the subject's previous move too closely.
#[derive(Debug, Clone)]
pub struct MoveCooldown {
    cooldown: Duration,
    last_move: Arc<DashMap<SubjectId, Instant>>,
}

impl MoveCooldown {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_move: Arc::new(DashMap::new()),
        }
    }

    fn check(&self, envelope: &mut Envelope<MoveItem>) -> Result<(), ListenerError> {
        let now = Instant::now();
        let subject = envelope.subject();
        let too_soon = self
            .last_move
            .get(&subject)
            .is_some_and(|last| now.duration_since(*last) < self.cooldown);
        if too_soon {
            debug!("⏱️ {} is moving items too fast", subject);
            envelope.cancel();
        } else {
            self.last_move.insert(subject, now);
        }
        Ok(())
    }

    /// Drops the subject's cooldown; called when it disconnects.
    pub fn forget(&self, subject: SubjectId) {
        self.last_move.remove(&subject);
    }

    /// Subjects with a recorded move.
    pub fn tracked(&self) -> usize {
        self.last_move.len()
    }
}

/// Registers every host listener and declares the per-kind guard policies.
///
/// Returns the move cooldown so disconnects can clear its per-subject state.
pub fn register_listeners(
    builder: &mut RegistryBuilder,
    settings: &HarnessSettings,
    world: &World,
    engine: &EngineHandle,
) -> MoveCooldown {
    let latency = Duration::from_millis(settings.permission_latency_ms);

    // Inventory
    let cooldown = MoveCooldown::new(Duration::from_millis(settings.move_cooldown_ms));
    let check = cooldown.clone();
    builder
        .on_sync::<MoveItem, _>("move-cooldown", Priority::HIGH, move |envelope| check.check(envelope))
        .on_async::<MoveItem, _>(
            "slot-permissions",
            Priority::NORMAL,
            SlotPermissions {
                world: world.clone(),
                engine: engine.clone(),
                locked_slots: settings.locked_slots.clone(),
                latency,
            },
        );

    // Sessions
    builder
        .on_async::<Handshake, _>(
            "whitelist",
            Priority::HIGH,
            Whitelist {
                banned: settings.banned_names.iter().map(CompactString::new).collect(),
                latency,
            },
        )
        .policy::<Handshake>(KindPolicy {
            guard: GuardShape::Pending(RetriggerPolicy::Suppress),
        });

    // Combat
    let armor_percent = settings.armor_percent.min(100);
    builder
        .on_sync::<DamageApplied, _>("no-self-damage", Priority::HIGHEST, |envelope| {
            if envelope.event().attacker == Some(envelope.subject()) {
                envelope.cancel();
            }
            Ok(())
        })
        .on_sync::<DamageApplied, _>("armor", Priority::NORMAL, move |envelope| {
            let outcome = envelope.outcome_mut();
            let absorbed = u64::from(outcome.amount) * u64::from(armor_percent) / 100;
            // absorbed <= amount, so it fits back into a u32.
            outcome.amount -= absorbed as u32;
            if outcome.amount == 0 {
                outcome.verdict.is_final = true;
            }
            Ok(())
        });

    // World
    let loot_world = world.clone();
    let loot_engine = engine.clone();
    builder
        .on_async_fn::<EntityDestroyed, _>("loot-drop", Priority::NORMAL, move |envelope| {
            let world = loot_world.clone();
            let engine = loot_engine.clone();
            async move {
                if envelope.event().kind != LOOT_SOURCE {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                let loot = engine
                    .call(move || world.spawn_entity(LOOT))
                    .await
                    .map_err(|e| ListenerError::Failed(e.to_string()))?;
                debug!("🎁 {} dropped loot {}", envelope.event().entity, loot);
                Ok(())
            }
            .boxed()
        })
        .on_sync::<EntityDestroyed, _>("destruction-audit", Priority::LOWEST, |envelope| {
            debug!(
                "🧾 {} destroyed {} ({})",
                envelope.subject(),
                envelope.event().entity,
                envelope.event().kind
            );
            Ok(())
        })
        .ignoring_cancelled::<EntityDestroyed>("destruction-audit");

    cooldown
}
