//! Command implementations for the sss3 client

pub mod devices;
pub mod run;

pub use devices::devices;
pub use run::run;
