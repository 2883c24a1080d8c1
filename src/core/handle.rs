//! Typed, generation-checked indices.

/// Reference to a rigid body in a [`RigidBodySet`](super::rigid::RigidBodySet).
///
/// The generation is bumped whenever a slot is freed, so a handle kept across
/// a removal resolves to nothing instead of to whichever body reused the slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyHandle {
    index: u32,
    generation: u32,
}

impl BodyHandle {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Position of a container in the registration order of a [`DofSystem`](crate::DofSystem).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub(crate) usize);

impl ContainerId {
    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }
}
