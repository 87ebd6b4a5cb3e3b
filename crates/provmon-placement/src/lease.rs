//! Lease-authority callbacks.

use provmon_state::InstantiatorResource;

/// Notifications from whatever grants, renews and expires instantiator
/// leases. The registry only reacts to these; it never grants a lease.
pub trait LeaseListener: Send + Sync {
    fn register(&self, resource: InstantiatorResource);

    /// The lease was renewed, usually with a fresh capability report.
    fn renewed(&self, resource: InstantiatorResource);

    fn expired(&self, id: &str);

    /// The lease was cancelled explicitly.
    fn removed(&self, id: &str);
}
