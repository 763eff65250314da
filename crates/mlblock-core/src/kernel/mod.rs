//! Kernel side - resource lifecycle, registration handshake and event reconciliation.

mod manager;
mod reconciler;
mod webhook;

pub use manager::{Heartbeat, KernelManager};
pub use reconciler::{EventReconciler, ReconcileOutcome};
pub use webhook::WebhookClient;
