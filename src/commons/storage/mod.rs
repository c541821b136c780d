//! Key-value storage shared by all instances of the gateway.

mod disk;
mod ident;
mod key;
mod kv;
mod memory;
mod scope;

pub use self::disk::Disk;
pub use self::ident::{
    Namespace, NamespaceBuf, ParseSegmentError, Segment, SegmentBuf,
};
pub use self::key::Key;
pub use self::kv::{
    KeyValueError, KeyValueStore, KeyValueStoreDispatcher, StorageResult,
};
pub use self::memory::Memory;
pub use self::scope::Scope;
