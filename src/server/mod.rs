mod job_routes;
pub mod metrics;
pub mod server;
pub mod state;

pub use server::{make_app, run_server};
