//! service-importer: Kubernetes controller that synchronizes `Endpoints`
//! membership with externally discovered backends and their live health.

pub mod controller;
pub mod fluconf;
pub mod health;
pub mod leader;
pub mod probes;
pub mod prober;
pub mod queue;
pub mod source;
