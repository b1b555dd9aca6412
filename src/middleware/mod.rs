pub mod admin;
pub mod security_headers;
pub mod tracing;

pub use admin::admin_auth_middleware;
pub use security_headers::security_headers_middleware;
pub use tracing::{request_id_middleware, REQUEST_ID_HEADER};
