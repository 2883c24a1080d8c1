pub mod assembly;
pub mod boundary;
pub mod container;
pub mod grid;
pub mod handle;
pub mod kernel;
pub mod neighbors;
pub mod offsets;
pub mod projection;
pub mod rigid;

pub use assembly::{DofBlock, GlobalSystem, RowBlock, RowView, SparseRow};
pub use boundary::{
    BodyWrench, BoundaryContact, BoundaryRows, ContactForces, NodeStencil, PointStencil,
};
pub use container::{ContainerKind, DofContainer, StepContext, check_offsets, warm_start};
pub use grid::{GridInterpolation, GridLayout, KERNEL_SIZE, NEIGHBOR_COUNT};
pub use handle::{BodyHandle, ContainerId};
pub use kernel::{CubicSpline, bspline_gradients, bspline_weights, inv_d};
pub use neighbors::{NeighborGrid, PackedCell, pack_coords, unpack_coords};
pub use offsets::{ContainerCounts, ContainerOffsets, OffsetTable};
pub use projection::{project_contact, project_unilateral};
pub use rigid::{BODY_DOFS, RigidBody, RigidBodySet, RigidShape};
