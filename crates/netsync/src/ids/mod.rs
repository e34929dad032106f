mod batch;
mod client;
mod server;

pub use batch::{IdBatch, NetId};
pub use client::{Allocation, BatchIntegrityError, ClientIdAllocator};
pub use server::{BatchLedger, ServerIdAuthority};
