pub mod cleanup;
pub mod config;
pub mod keys;
pub mod reencrypt;

pub use cleanup::*;
pub use config::*;
pub use keys::*;
pub use reencrypt::*;
