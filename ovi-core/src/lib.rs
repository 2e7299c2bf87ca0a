#![forbid(unsafe_code)]

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod config;
pub mod error;

pub mod hash {
    pub mod sha256;
}

pub mod codec;

pub mod chunking {
    pub mod plan;
}

pub mod sparse {
    pub mod writer;
}

pub mod cache;

pub mod oci {
    pub mod client;
    pub mod manifest;
    pub mod reference;
}

pub mod transfer;

pub mod pull;
pub mod push;

pub use crate::error::{OviError, Result};

pub use config::RegistryConfig;
pub use pull::{PullOptions, pull};
pub use push::{PushOptions, push};

pub mod prelude {
    pub use crate::Result;
    pub use crate::config::RegistryConfig;
    pub use crate::oci::manifest::{OciDescriptor, OciManifest};
    pub use crate::pull::{PullOptions, pull};
    pub use crate::push::{PushOptions, push};
    pub use crate::transfer::TransferProgress;
}
