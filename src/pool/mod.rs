// Credential pool module
// Owns the per-credential health records, the selection policies, and the
// background recovery sweeper.

pub mod record;
pub mod registry;
pub mod selector;
pub mod sweeper;

pub use record::{CredentialSnapshot, HealthState};
pub use registry::{CredentialPool, PoolStats};
pub use selector::SelectionPolicy;
pub use sweeper::spawn_sweeper;
