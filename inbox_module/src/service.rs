mod handlers;
mod server;
mod state;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use server::{build_router, run_server, start_runtime, RuntimeControl, UnavailableGenerator};
pub use state::GatewayState;
