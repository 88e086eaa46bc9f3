//! # Engine Hooks
//!
//! Interception points wrapped around the world's own operations. Each
//! method here is what the engine calls instead of the `_raw` operation:
//!
//! | Operation | Hook | Dispatch |
//! |-----------|------|----------|
//! | [`EngineHooks::move_item`] | prefix | continuation bridge, flag guard |
//! | [`EngineHooks::handshake`] | prefix | continuation bridge, pending guard |
//! | [`EngineHooks::apply_damage`] | prefix | synchronous decision |
//! | [`EngineHooks::destroy_entity`] | postfix | fire-and-forget |
//!
//! Replays re-enter through the same method; the bridge's flag guard lets
//! them through without a second dispatch.

use crate::events::{DamageApplied, DamageOutcome, EntityDestroyed, Handshake, MoveItem};
use crate::listeners::MoveCooldown;
use crate::world::{EntityId, World};
use compact_str::CompactString;
use hook_bridge::{
    replay_fn, BridgeError, ContinuationBridge, Dispatched, Dispatcher, EngineHandle, Envelope, LifetimeToken, Replay,
    ReplayError, SessionTokens, SubjectId, Verdict,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Every interception point the host exposes to its tick loop.
#[derive(Debug, Clone)]
pub struct EngineHooks {
    world: World,
    sessions: Arc<SessionTokens>,
    root: LifetimeToken,
    dispatcher: Arc<Dispatcher>,
    moves: ContinuationBridge<MoveItem>,
    handshakes: ContinuationBridge<Handshake>,
    cooldown: MoveCooldown,
    inventory_size: usize,
}

impl EngineHooks {
    /// Must be called on the engine thread, after `engine` was created there.
    pub fn new(
        world: World,
        root: LifetimeToken,
        dispatcher: Arc<Dispatcher>,
        engine: EngineHandle,
        cooldown: MoveCooldown,
        inventory_size: usize,
    ) -> Self {
        let moves = ContinuationBridge::new(dispatcher.clone(), engine.clone());
        let handshakes = ContinuationBridge::new(dispatcher.clone(), engine);
        Self {
            world,
            sessions: Arc::new(SessionTokens::new(root.clone())),
            root,
            dispatcher,
            moves,
            handshakes,
            cooldown,
            inventory_size,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn sessions(&self) -> &SessionTokens {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The bridge for moves, exposing its per-subject replay order.
    pub fn move_bridge(&self) -> &ContinuationBridge<MoveItem> {
        &self.moves
    }

    pub fn cooldown(&self) -> &MoveCooldown {
        &self.cooldown
    }

    /// The bridge for handshakes, exposing its pending set.
    pub fn handshake_bridge(&self) -> &ContinuationBridge<Handshake> {
        &self.handshakes
    }

    /// Moves an item between slots. Returns true if the item moved now.
    ///
    /// A `false` answer may still be followed by a replayed move once the
    /// permission check completes.
    pub fn move_item(&self, subject: SubjectId, from: usize, to: usize) -> bool {
        let Some(stack) = self.world.item_in(subject, from) else {
            return false;
        };
        let Some(lifetime) = self.sessions.get(subject) else {
            return false;
        };

        let allowed = self.moves.intercept(
            || {
                Envelope::new(
                    subject,
                    MoveItem {
                        item: stack.item.clone(),
                        from_slot: from,
                        to_slot: to,
                    },
                    Verdict::default(),
                    lifetime,
                )
            },
            MoveReplay {
                hooks: self.clone(),
                subject,
                item: stack.item.clone(),
                to,
            },
        );
        if !allowed {
            return false;
        }

        match self.world.move_item_raw(subject, from, to) {
            Ok(()) => {
                debug!("📦 {} moved {} from slot {} to {}", subject, stack.item, from, to);
                true
            }
            Err(e) => {
                debug!("📦 Move for {} not applied: {}", subject, e);
                false
            }
        }
    }

    /// Asks to join `subject` as `name`. Returns true once the player is in
    /// the world.
    ///
    /// The first call starts the subject's session. While a handshake is
    /// outstanding, retries are denied without a second dispatch.
    pub fn handshake(&self, subject: SubjectId, name: &str, attempt: u32) -> bool {
        if self.world.is_present(subject) {
            return true;
        }
        let lifetime = self
            .sessions
            .get(subject)
            .unwrap_or_else(|| self.sessions.begin(subject));

        let name = CompactString::new(name);
        let event_name = name.clone();
        let replay_name = name.clone();
        let hooks = self.clone();
        let allowed = self.handshakes.intercept(
            || {
                Envelope::new(
                    subject,
                    Handshake {
                        name: event_name,
                        attempt,
                    },
                    Verdict::default(),
                    lifetime,
                )
            },
            replay_fn::<Handshake, _>(move |_| {
                if hooks.handshake(subject, &replay_name, attempt) {
                    Ok(())
                } else {
                    Err(ReplayError::Failed(format!("{replay_name} could not be spawned")))
                }
            }),
        );
        if !allowed {
            return false;
        }

        match self.world.spawn_player(subject, &name, self.inventory_size) {
            Ok(()) => {
                info!("🎮 {} joined as '{}' (attempt {})", subject, name, attempt);
                true
            }
            Err(e) => {
                debug!("🎮 Join for {} not applied: {}", subject, e);
                false
            }
        }
    }

    /// Ends the subject's session and removes it from the world.
    ///
    /// Outstanding continuations for the subject are dropped when they reach
    /// the engine thread.
    pub fn disconnect(&self, subject: SubjectId) -> bool {
        let had_session = self.sessions.end(subject);
        let removed = self.world.remove_player(subject);
        self.cooldown.forget(subject);
        if had_session || removed {
            info!("👋 {} disconnected", subject);
        }
        removed
    }

    /// Applies damage to `subject` after a synchronous decision.
    ///
    /// Returns the amount actually applied.
    pub fn apply_damage(&self, subject: SubjectId, attacker: Option<SubjectId>, raw: u32) -> Result<u32, BridgeError> {
        let Some(lifetime) = self.sessions.get(subject) else {
            return Ok(0);
        };
        let dispatched = self.dispatcher.decide(Envelope::new(
            subject,
            DamageApplied { attacker, raw },
            DamageOutcome {
                verdict: Verdict::default(),
                amount: raw,
            },
            lifetime,
        ))?;
        if !dispatched.allowed() {
            return Ok(0);
        }

        let amount = dispatched.outcome().amount;
        match self.world.apply_damage_raw(subject, amount) {
            Ok(remaining) => {
                debug!("⚔️ {} took {} damage ({} left)", subject, amount, remaining);
                Ok(amount)
            }
            Err(e) => {
                warn!("⚠️ Damage for {} not applied: {}", subject, e);
                Ok(0)
            }
        }
    }

    /// Destroys an entity, then announces it. Returns false if the entity
    /// did not exist.
    pub fn destroy_entity(&self, entity: EntityId, by: SubjectId) -> bool {
        let Some(kind) = self.world.destroy_entity_raw(entity) else {
            return false;
        };
        let lifetime = self.sessions.get(by).unwrap_or_else(|| self.root.child());
        self.dispatcher.fire(Envelope::informational(
            by,
            EntityDestroyed { entity, kind },
            Verdict::default(),
            lifetime,
        ));
        true
    }
}

/// Replays a denied move against wherever the item is now.
struct MoveReplay {
    hooks: EngineHooks,
    subject: SubjectId,
    item: CompactString,
    to: usize,
}

impl Replay<MoveItem> for MoveReplay {
    /// The item's current slot.
    type Live = usize;

    fn revalidate(&mut self, _dispatched: &Dispatched<MoveItem>) -> Option<usize> {
        let world = self.hooks.world();
        let from = world.slot_of(self.subject, &self.item)?;
        if from == self.to || world.item_in(self.subject, self.to).is_some() {
            return None;
        }
        Some(from)
    }

    fn apply(self, _dispatched: &Dispatched<MoveItem>, from: usize) -> Result<(), ReplayError> {
        if self.hooks.move_item(self.subject, from, self.to) {
            Ok(())
        } else {
            Err(ReplayError::Failed(format!(
                "{} could not be moved to slot {}",
                self.item, self.to
            )))
        }
    }
}
