//! Jump-server chains

mod plan;
mod resolver;

pub use plan::JumpChainPlan;
pub use resolver::ChainResolver;
