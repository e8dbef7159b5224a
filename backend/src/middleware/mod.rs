pub mod gateway;
pub mod logging;
pub mod request_id;

pub use gateway::{gateway_context, GatewayContext};
pub use logging::log_error_responses;
pub use request_id::{request_id, RequestId};
