//! Client-side state for the purchase-request app: the remote backend adapter, the signed-in
//! session with its resolved permissions, and the organization data cache.

pub mod remote;
pub mod session;
pub mod store;

pub use remote::RemoteBackend;
pub use session::SessionContext;
pub use store::{DataStore, RefreshOutcome, Snapshot};
