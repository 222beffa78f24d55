pub mod pipe;
pub mod socket_pool;

/// Which transport currently services dispatched commands.
///
/// A spawn begins `Pipe`; it may upgrade to `SocketPool` once the
/// diagnostics scanner observes the transport-upgrade advertisement.
/// Downgrade is not supported within a single spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Pipe,
    SocketPool,
}

/// Coordinates the "first observer wins" rule for the transport-upgrade
/// marker, which the child may write on either the diagnostics stream (via
/// the scanner) or the response stream (inside the pipe transport's read
/// loop), and precedence between the two is otherwise unspecified; this
/// gate makes the second observer's call a no-op.
#[derive(Default)]
pub struct UpgradeGate {
    claimed: std::sync::atomic::AtomicBool,
}

impl UpgradeGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call is the first to claim the upgrade.
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_ok()
    }
}
