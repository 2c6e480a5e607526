//! # radrotor
//!
//! `radrotor` runs a local FreeRADIUS daemon and keeps it supplied with valid TLS
//! material fetched from an upstream authorization API.
//!
//! ## Components
//!
//! - [`radius`]: renders a FreeRADIUS configuration tree from a
//!   [`config::RadiusConfig`] and supervises one `radiusd` process started from it.
//! - [`updater`]: a single control loop that resolves the best available
//!   certificate (remote API, then the on-disk cache, then the certificate embedded
//!   in the configuration) and swaps the supervised process only after the
//!   replacement has started.
//! - [`daemon`]: the lifecycle contract shared by both, and the signal-driven
//!   orchestration used by the binary.
//!
//! ## Run directory layout
//!
//! ```text
//! <run_directory>/radius/
//!   radiusd.conf
//!   sites-enabled/
//!   mods-enabled/
//!   tls/{private.pem,bundle.pem,ca.pem,dhparam.pem}
//! ```

pub mod cli;
pub mod config;
pub mod daemon;
pub mod radius;
pub mod updater;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
