mod blob_store;
mod kv;
mod mode;

pub use blob_store::{
    BlobStoreError, DirBlobStore, ImageRecord, LocalBlobStore, MemoryBlobStore,
};
pub use kv::{KeyValueStore, KvError};
pub use mode::{is_managed_deployment, resolve_storage_mode, StorageMode};
