//! Tracing and logging setup shared by job nodes.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize with `default_directive` when `RUST_LOG` is unset.
pub fn init_with_default(default_directive: &str) {
    tracing::init_with_default(default_directive);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
