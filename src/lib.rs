pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod mappers;
pub mod middleware;
pub mod model_mapping;
pub mod pool;
pub mod server;
pub mod upstream;
pub mod util;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use pool::CredentialPool;
pub use server::AppState;
