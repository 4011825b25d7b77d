pub mod config;
pub mod error;
pub mod master;
pub mod matcher;
pub mod minion;
pub mod pki;
pub mod protocol;
pub mod shutdown;
pub mod transport;
