pub mod error;
pub mod rpc;

pub use error::ProxyError;
pub use rpc::{ErrorObject, InboundRecord, OutboundRecord, RequestId};
