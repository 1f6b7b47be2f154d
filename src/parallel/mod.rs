pub mod coordinator;
pub mod partition;
pub mod transport;
