//! Client-side scene mirror.

use tracing::{trace, warn};
use turnsync_lockstep::{Turn, TurnApplyError, TurnHandler, TurnNumber};

use crate::{EntityId, EntityState, Scene, SceneDelta, Transform};

/// Application side of the scene mirror, addressed by entity id.
pub trait EntitySink {
    fn on_spawn(&mut self, id: EntityId, state: &EntityState);

    fn on_update(&mut self, id: EntityId, transform: &Transform);

    fn on_despawn(&mut self, id: EntityId);
}

/// Mirror without an application attached.
impl EntitySink for () {
    fn on_spawn(&mut self, _id: EntityId, _state: &EntityState) {}

    fn on_update(&mut self, _id: EntityId, _transform: &Transform) {}

    fn on_despawn(&mut self, _id: EntityId) {}
}

/// Applies the scene deltas carried by turns.
pub struct ClientSceneController<S: EntitySink = ()> {
    scene: Scene,
    sink: S,
    last_turn: Option<TurnNumber>,
}

impl<S: EntitySink> ClientSceneController<S> {
    pub fn new(sink: S) -> Self {
        Self {
            scene: Scene::new(),
            sink,
            last_turn: None,
        }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Last turn applied, if any.
    pub fn last_turn(&self) -> Option<TurnNumber> {
        self.last_turn
    }
}

impl<S: EntitySink> TurnHandler for ClientSceneController<S> {
    fn apply_turn(&mut self, turn: &Turn) -> Result<(), TurnApplyError> {
        let number = turn.number();
        self.last_turn = Some(number);
        if turn.delta().is_empty() {
            return Ok(());
        }

        let delta = SceneDelta::decode(turn.delta())
            .map_err(|err| TurnApplyError::new(number, err.to_string()))?;
        if let Err(err) = delta.apply(&mut self.scene) {
            warn!(turn = number, %err, "scene delta does not fit the mirrored scene");
            return Err(TurnApplyError::new(number, err.to_string()));
        }
        trace!(
            turn = number,
            spawned = delta.spawned.len(),
            updated = delta.updated.len(),
            despawned = delta.despawned.len(),
            "applied scene delta"
        );

        for id in &delta.despawned {
            self.sink.on_despawn(*id);
        }
        for (id, state) in &delta.spawned {
            self.sink.on_spawn(*id, state);
        }
        for (id, transform) in &delta.updated {
            self.sink.on_update(*id, transform);
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
