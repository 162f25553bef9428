//! Database link lifecycle.
//!
//! Links are opened through a [`Connector`], shared per connection id and
//! released when the last session using them goes away.

mod connector;
mod lifecycle;

pub use connector::{ConfigConnector, Connector, MockConnector};
pub use lifecycle::{ConnectionLifecycle, HealthCheck, SessionListener};
