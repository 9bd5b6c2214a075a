pub mod manager;
pub mod record;

pub use manager::WalManager;
pub use record::{
    CheckpointPayload, CompensationAction, Lsn, RowLocation, WalPayload, WalRecord,
    WalRecordHeader,
};
