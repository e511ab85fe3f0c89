pub mod error;
pub mod store;
pub mod rwlock;
pub mod lru;
pub mod backend;
pub mod block;
pub mod buffer;
pub mod vtable;
pub mod superblock;
pub mod rw;
pub mod ro;

pub use backend::Backend;
pub use ro::RoStore;
pub use rw::{RwStore, StoreOptions};
pub use store::FragmentStore;
pub use superblock::Geometry;
pub use vtable::ROOT_VNODE;

/// Identifies one logical object stored in the engine. Vnode 1 is reserved
/// for the mount adapter's directory table and is never handed out again.
pub type Vnode = u64;

/// Address of one half of a backend slot: the slot index is `inode / 2` and
/// the half within it is `inode % 2`. Negative values are sentinels for
/// fragments whose authoritative bytes currently live in the staging buffer.
pub type Inode = i64;
