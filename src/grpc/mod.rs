pub mod monitor_service;
pub mod replica_service;
pub mod server;

pub use server::GrpcServer;
