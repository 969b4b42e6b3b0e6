//! Profiling of forward passes with [Tracy](https://github.com/wolfpld/tracy).

use tracing_subscriber::{
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Installs a global subscriber that streams the kernels' spans to a Tracy client.
///
/// Fails if a global subscriber was already set.
pub fn init() -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(tracing_tracy::TracyLayer::default())
        .try_init()
}
