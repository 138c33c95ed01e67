//! Port traits (hexagonal boundaries)
//!
//! Everything the engine consumes or emits crosses one of these traits:
//! the cloud RPC client, the transfer pipeline, the local filesystem, the
//! config blob store, and the application observer. Concrete adapters
//! live outside the core.

pub mod cloud_client;
pub mod config_db;
pub mod filesystem;
pub mod observer;
pub mod transfer_pipeline;

pub use cloud_client::{DeltaBatch, ICloudClient, NewNode, RemoteDelta, RpcFailure};
pub use config_db::IConfigDb;
pub use filesystem::{EntryInfo, IFileSystem};
pub use observer::{ISyncObserver, NullObserver, TransferDirection, TransferPhase};
pub use transfer_pipeline::ITransferPipeline;
