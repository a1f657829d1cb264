//! Server-side scene replication.
//!
//! [`ServerSceneController`] plugs into the server lockstep loop as its
//! [`ServerSimulation`]. Behaviours mutate the authoritative scene in
//! response to connections and commands; after every turn the controller
//! diffs the scene against what was last sent and returns the encoded
//! [`SceneDelta`] for that turn.

use std::time::Duration;

use tracing::{debug, trace};
use turnsync_lockstep::{ClientId, Command, TurnNumber};
use turnsync_server::ServerSimulation;

use crate::{Scene, SceneDelta};

/// Handle returned by [`ServerSceneController::add_behaviour`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BehaviourId(u64);

/// Pluggable server logic. Every hook receives the authoritative scene.
///
/// Behaviours run in registration order, and for each command before the
/// per-turn `update`.
pub trait ServerBehaviour {
    fn on_client_connected(&mut self, _scene: &mut Scene, _client_id: ClientId) {}

    fn on_client_disconnected(&mut self, _scene: &mut Scene, _client_id: ClientId) {}

    fn on_command(&mut self, _scene: &mut Scene, _command: &Command) {}

    fn update(&mut self, _scene: &mut Scene, _dt: Duration) {}
}

pub struct ServerSceneController {
    scene: Scene,
    /// Scene as last replicated.
    sent: Scene,
    behaviours: Vec<(BehaviourId, Box<dyn ServerBehaviour>)>,
    next_behaviour: u64,
}

impl Default for ServerSceneController {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerSceneController {
    pub fn new() -> Self {
        Self::with_scene(Scene::new())
    }

    /// Start from a pre-populated scene. Entities already present are sent
    /// as spawns with the first turn.
    pub fn with_scene(scene: Scene) -> Self {
        Self {
            scene,
            sent: Scene::new(),
            behaviours: Vec::new(),
            next_behaviour: 0,
        }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn add_behaviour(&mut self, behaviour: impl ServerBehaviour + 'static) -> BehaviourId {
        let id = BehaviourId(self.next_behaviour);
        self.next_behaviour += 1;
        self.behaviours.push((id, Box::new(behaviour)));
        id
    }

    /// Returns false if `id` was not (or no longer) registered.
    pub fn remove_behaviour(&mut self, id: BehaviourId) -> bool {
        let before = self.behaviours.len();
        self.behaviours.retain(|(entry, _)| *entry != id);
        self.behaviours.len() != before
    }

    pub fn behaviour_count(&self) -> usize {
        self.behaviours.len()
    }
}

impl ServerSimulation for ServerSceneController {
    fn on_client_connected(&mut self, client_id: ClientId) {
        for (_, behaviour) in &mut self.behaviours {
            behaviour.on_client_connected(&mut self.scene, client_id);
        }
    }

    fn on_client_disconnected(&mut self, client_id: ClientId) {
        for (_, behaviour) in &mut self.behaviours {
            behaviour.on_client_disconnected(&mut self.scene, client_id);
        }
    }

    fn step(&mut self, turn: TurnNumber, commands: &[Command], dt: Duration) -> Vec<u8> {
        for command in commands {
            for (_, behaviour) in &mut self.behaviours {
                behaviour.on_command(&mut self.scene, command);
            }
        }
        for (_, behaviour) in &mut self.behaviours {
            behaviour.update(&mut self.scene, dt);
        }

        let delta = SceneDelta::diff(&self.sent, &self.scene);
        if delta.is_empty() {
            trace!(turn, "scene unchanged");
            return Vec::new();
        }
        debug!(
            turn,
            spawned = delta.spawned.len(),
            updated = delta.updated.len(),
            despawned = delta.despawned.len(),
            "replicating scene delta"
        );
        self.sent.clone_from(&self.scene);
        delta.encode()
    }
}
