//! turnsync Scene Replication
//!
//! A minimal scene model replicated through the turn stream:
//! - [`Scene`]: entities keyed by [`EntityId`], iterated in id order
//! - [`SceneDelta`]: the difference between two scenes, carried as a turn's
//!   state delta
//! - [`ServerSceneController`]: server simulation hook driving pluggable
//!   behaviours and producing one delta per sealed turn
//! - [`ClientSceneController`]: turn handler mirroring the scene and
//!   notifying an application [`EntitySink`]
//!
//! The scene never owns application objects. Rendering, physics and asset
//! handling stay on the other side of [`EntitySink`].

#![deny(unsafe_code)]

pub mod client;
pub mod server;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use prost::Message;
use thiserror::Error;
use turnsync_lockstep::StateHasher;
use turnsync_wire::{
    EntitySpawnProto, EntityUpdateProto, SceneDeltaProto, TransformProto, WireError,
};

pub use client::{ClientSceneController, EntitySink};
pub use server::{BehaviourId, ServerBehaviour, ServerSceneController};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("entity {0} already exists")]
    DuplicateEntity(EntityId),
    #[error("entity {0} does not exist")]
    UnknownEntity(EntityId),
    #[error("entity {0} is listed twice in one delta")]
    RepeatedInDelta(EntityId),
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl From<prost::DecodeError> for SceneError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Wire(WireError::Decode(err))
    }
}

// ============================================================================
// Scene Model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Transform {
    pub position: [f64; 3],
    /// Radians around the vertical axis.
    pub rotation: f64,
}

impl Transform {
    pub fn at(x: f64, y: f64, z: f64) -> Self {
        Self {
            position: [x, y, z],
            rotation: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityState {
    /// Application-defined object type.
    pub kind: u32,
    pub transform: Transform,
}

/// Entities ordered by id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Scene {
    entities: BTreeMap<EntityId, EntityState>,
    next_id: u32,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entity with the next free id. Ids are allocated in spawn
    /// order and never reused.
    pub fn spawn(&mut self, kind: u32, transform: Transform) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        self.entities.insert(id, EntityState { kind, transform });
        id
    }

    /// Insert an entity under a known id (mirroring).
    pub fn insert(&mut self, id: EntityId, state: EntityState) -> Result<(), SceneError> {
        if self.entities.contains_key(&id) {
            return Err(SceneError::DuplicateEntity(id));
        }
        self.entities.insert(id, state);
        self.next_id = self.next_id.max(id.0.saturating_add(1));
        Ok(())
    }

    pub fn set_transform(&mut self, id: EntityId, transform: Transform) -> Result<(), SceneError> {
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(SceneError::UnknownEntity(id))?;
        entity.transform = transform;
        Ok(())
    }

    pub fn despawn(&mut self, id: EntityId) -> Result<EntityState, SceneError> {
        self.entities
            .remove(&id)
            .ok_or(SceneError::UnknownEntity(id))
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityState> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &EntityState)> {
        self.entities.iter().map(|(id, state)| (*id, state))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Order-independent of construction history: two scenes with the same
    /// entities have the same digest.
    pub fn digest(&self) -> u64 {
        let mut hasher = StateHasher::new();
        hasher.update_u64(self.entities.len() as u64);
        for (id, state) in &self.entities {
            hasher.update_u32(id.0);
            hasher.update_u32(state.kind);
            for axis in state.transform.position {
                hasher.update_f64(axis);
            }
            hasher.update_f64(state.transform.rotation);
        }
        hasher.finish()
    }
}

// ============================================================================
// Scene Delta
// ============================================================================

/// Changes between two scenes, each list ordered by entity id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SceneDelta {
    pub spawned: Vec<(EntityId, EntityState)>,
    pub updated: Vec<(EntityId, Transform)>,
    pub despawned: Vec<EntityId>,
}

impl SceneDelta {
    /// Changes that turn `previous` into `current`. An entity whose kind
    /// changed is despawned and spawned again.
    pub fn diff(previous: &Scene, current: &Scene) -> Self {
        let mut delta = Self::default();
        for (id, state) in &current.entities {
            match previous.entities.get(id) {
                None => delta.spawned.push((*id, *state)),
                Some(old) if old.kind != state.kind => {
                    delta.despawned.push(*id);
                    delta.spawned.push((*id, *state));
                }
                Some(old) if old.transform != state.transform => {
                    delta.updated.push((*id, state.transform));
                }
                Some(_) => {}
            }
        }
        for id in previous.entities.keys() {
            if !current.entities.contains_key(id) {
                delta.despawned.push(*id);
            }
        }
        delta.despawned.sort();
        delta
    }

    pub fn is_empty(&self) -> bool {
        self.spawned.is_empty() && self.updated.is_empty() && self.despawned.is_empty()
    }

    /// Apply to `scene`: despawns, then spawns, then updates. The scene is
    /// left untouched if any change does not fit it.
    pub fn apply(&self, scene: &mut Scene) -> Result<(), SceneError> {
        self.check(scene)?;
        for id in &self.despawned {
            scene.despawn(*id)?;
        }
        for (id, state) in &self.spawned {
            scene.insert(*id, *state)?;
        }
        for (id, transform) in &self.updated {
            scene.set_transform(*id, *transform)?;
        }
        Ok(())
    }

    fn check(&self, scene: &Scene) -> Result<(), SceneError> {
        let despawned = self.despawned.iter().copied();
        let spawned = self.spawned.iter().map(|(id, _)| *id);
        let updated = self.updated.iter().map(|(id, _)| *id);
        reject_repeats(despawned)?;
        reject_repeats(spawned)?;
        reject_repeats(updated)?;

        for id in &self.despawned {
            if !scene.contains(*id) {
                return Err(SceneError::UnknownEntity(*id));
            }
        }
        for (id, _) in &self.spawned {
            if scene.contains(*id) && !self.despawned.contains(id) {
                return Err(SceneError::DuplicateEntity(*id));
            }
        }
        for (id, _) in &self.updated {
            let exists = (scene.contains(*id) && !self.despawned.contains(id))
                || self.spawned.iter().any(|(spawned, _)| spawned == id);
            if !exists {
                return Err(SceneError::UnknownEntity(*id));
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        SceneDeltaProto::from(self).encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SceneError> {
        let proto = SceneDeltaProto::decode(bytes)?;
        Self::try_from(proto)
    }
}

fn reject_repeats(ids: impl Iterator<Item = EntityId>) -> Result<(), SceneError> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(SceneError::RepeatedInDelta(id));
        }
    }
    Ok(())
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<Transform> for TransformProto {
    fn from(t: Transform) -> Self {
        Self {
            position: t.position.to_vec(),
            rotation: t.rotation,
        }
    }
}

impl TryFrom<TransformProto> for Transform {
    type Error = WireError;

    fn try_from(proto: TransformProto) -> Result<Self, Self::Error> {
        let position: [f64; 3] =
            proto
                .position
                .as_slice()
                .try_into()
                .map_err(|_| WireError::Invalid {
                    field: "position",
                    reason: format!("expected 3 components, got {}", proto.position.len()),
                })?;
        Ok(Self {
            position,
            rotation: proto.rotation,
        })
    }
}

fn transform_from_wire(proto: Option<TransformProto>) -> Result<Transform, WireError> {
    proto
        .ok_or(WireError::Invalid {
            field: "transform",
            reason: "missing".to_string(),
        })?
        .try_into()
}

impl From<&SceneDelta> for SceneDeltaProto {
    fn from(delta: &SceneDelta) -> Self {
        Self {
            spawned: delta
                .spawned
                .iter()
                .map(|(id, state)| EntitySpawnProto {
                    entity_id: id.0,
                    kind: state.kind,
                    transform: Some(state.transform.into()),
                })
                .collect(),
            updated: delta
                .updated
                .iter()
                .map(|(id, transform)| EntityUpdateProto {
                    entity_id: id.0,
                    transform: Some((*transform).into()),
                })
                .collect(),
            despawned: delta.despawned.iter().map(|id| id.0).collect(),
        }
    }
}

impl TryFrom<SceneDeltaProto> for SceneDelta {
    type Error = SceneError;

    fn try_from(proto: SceneDeltaProto) -> Result<Self, Self::Error> {
        let spawned = proto
            .spawned
            .into_iter()
            .map(|s| -> Result<_, WireError> {
                Ok((
                    EntityId(s.entity_id),
                    EntityState {
                        kind: s.kind,
                        transform: transform_from_wire(s.transform)?,
                    },
                ))
            })
            .collect::<Result<_, WireError>>()?;
        let updated = proto
            .updated
            .into_iter()
            .map(|u| -> Result<_, WireError> {
                Ok((EntityId(u.entity_id), transform_from_wire(u.transform)?))
            })
            .collect::<Result<_, WireError>>()?;
        Ok(Self {
            spawned,
            updated,
            despawned: proto.despawned.into_iter().map(EntityId).collect(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
