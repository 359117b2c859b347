// ABOUTME: Command implementations for the CLI
// ABOUTME: Exports the sync and check commands

pub mod check;
pub mod sync;

pub use check::CheckOptions;
pub use sync::SyncOptions;
