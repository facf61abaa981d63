//! Storage side of the queue
//!
//! This module provides the block device abstraction the queue reads and
//! writes through, and the encrypted area arithmetic shared by the pipeline
//! and the conversion engine.

pub mod device;
pub mod protected;
pub mod region;

pub use device::{
    read_exact_at, read_skipping_unreadable, zero_unreadable_sectors, BlockDevice, FileDevice,
    MemoryDevice,
};
pub use protected::ProtectedSectors;
pub use region::{
    data_unit_index, get_intersection, regions_overlap, split_remapped, AreaBounds,
    PhysicalAccess, SharedBounds, AREA_EMPTY,
};
