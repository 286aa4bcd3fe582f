pub mod registry;

pub use registry::{IdentityRegistry, IdentityUpdate};
