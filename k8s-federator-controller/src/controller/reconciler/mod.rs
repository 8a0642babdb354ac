pub mod cluster;
pub mod context;
pub mod csr;
pub mod error;
