pub mod config;
pub mod error;
pub mod types;

pub use error::{OfsResult, SyncError};
pub use types::{
    now_millis, ClientInfo, EntityVersion, Operation, SyncItem, TenantId, PROTOCOL_VERSION,
};
