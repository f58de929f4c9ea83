//! Outbound HTTP transports used by the external worker.

pub mod reqwest_transport;
pub mod scripted;

pub use reqwest_transport::ReqwestTransport;
pub use scripted::ScriptedTransport;
