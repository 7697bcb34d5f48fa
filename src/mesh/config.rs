use std::time::Duration;

use typed_builder::TypedBuilder;

const DEFAULT_MAX_HOPS: usize = 16;
const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SEEN_COMMANDS: usize = 4096;

/// Per-node forwarding settings.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NodeConfig {
    /// Commands that already went through this many nodes are not relayed
    /// any further.
    #[builder(default = DEFAULT_MAX_HOPS)]
    pub max_hops: usize,
    /// How long to wait for a neighbour's reply before giving up on it.
    #[builder(default = DEFAULT_FORWARD_TIMEOUT)]
    pub forward_timeout: Duration,
    /// How many recent command ids a node remembers. A command that comes
    /// back while its id is remembered is turned away.
    #[builder(default = DEFAULT_SEEN_COMMANDS)]
    pub seen_commands: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
