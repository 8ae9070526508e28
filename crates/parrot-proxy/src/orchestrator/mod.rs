//! Session orchestration: materialize the app, attach the redirector,
//! start the proxy, drain captures, and stop with a typed reason.

pub mod ingress;
mod runner;

pub use runner::{run_session, IngressPlan, SessionPlan};
