//! The single shared admission coordinator and the ways to reach it.

mod actor;
mod backend;
mod remote;

pub use actor::{AdmissionCoordinator, CoordinatorHandle, CoordinatorOptions};
pub use backend::AdmissionBackend;
pub use remote::{
    coordinator_router, CheckPayload, DecisionPayload, RemoteCoordinator, WireDimension, CHECK_PATH,
};
