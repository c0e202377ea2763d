pub mod cork;
pub mod nat;
pub mod relay;
pub mod server;
pub mod stream;

mod tcp;
mod udp;

use std::sync::Arc;

use crate::common::IpPolicy;
use crate::dns::Resolver;
use crate::filter::DomainFilter;

pub use cork::CorkedStream;
pub use nat::NatMap;
pub use relay::relay;
pub use server::Tenant;
pub use stream::AeadStream;

/// Data-plane collaborators shared by every tenant. Constructed once at
/// startup and handed down explicitly; nothing here is a global.
pub struct ServerContext {
    pub resolver: Arc<Resolver>,
    pub filter: Arc<DomainFilter>,
    pub policy: Arc<IpPolicy>,
    /// Where blocked TCP sessions are transparently redirected. When unset,
    /// blocked sessions simply close.
    pub hijack: Option<String>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn test_context(hijack: Option<String>) -> Arc<ServerContext> {
        let filter = Arc::new(DomainFilter::new(Vec::new()));
        let policy = Arc::new(IpPolicy::new());
        let resolver = Arc::new(Resolver::new(filter.clone(), policy.clone()));
        Arc::new(ServerContext {
            resolver,
            filter,
            policy,
            hijack,
        })
    }
}
