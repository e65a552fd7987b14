pub mod bounded_path;
pub mod config;
pub mod credentials;
pub mod logging;

pub use bounded_path::{BoundedPath, DirPrefix};
pub use credentials::Credentials;
