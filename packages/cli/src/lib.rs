// ABOUTME: Library half of the runhub binary
// ABOUTME: Process wiring per role plus tracing initialisation

pub mod app;
pub mod logging;

pub use app::{build_router, run_gateway, run_hub, run_standalone, run_worker};
pub use logging::init_tracing;
