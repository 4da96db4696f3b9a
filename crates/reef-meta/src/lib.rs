//! Metadata persistence layer wrapping Fjall.
//!
//! [`MetaStore`] provides typed accessors over three Fjall keyspaces that
//! hold the control plane's durable state:
//!
//! - `volumes`: [`VolumeId`](reef_types::VolumeId) → serialized [`Volume`](reef_types::Volume)
//! - `pools`: [`PoolId`](reef_types::PoolId) → serialized [`Pool`](reef_types::Pool)
//! - `pending`: `node/volume/object` → serialized
//!   [`PendingCleanup`](reef_types::PendingCleanup), the ledger of teardown
//!   steps deferred because their node was unreachable

mod error;
mod store;

pub use error::MetaError;
pub use store::{MetaStore, Transition};
