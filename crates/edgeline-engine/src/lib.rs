//! edgeline-engine: the decision path and the loops around it.
//! The daemon and the integration tests both build on `node::EdgeNode`.

pub mod agents;
pub mod autonomy;
pub mod cache;
pub mod cluster;
pub mod ingress;
pub mod manager;
pub mod monitor;
pub mod node;
pub mod predictor;
pub mod remote;
pub mod router;
pub mod selection;
pub mod sim;
pub mod telemetry;
pub mod transport;

pub use node::{BackgroundTasks, EdgeNode};
pub use router::{Router, SubmitError};
