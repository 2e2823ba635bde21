pub mod backend;
pub mod client;
pub mod descriptor;
pub mod resource;
pub mod sync;
pub(crate) mod utils;

/// Default user agent for kubesync - automatically uses the package version
///
/// All list/watch traffic should go through `client::new(Some(USER_AGENT))`
/// so the cache's requests are attributable in apiserver logs.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
