pub mod build;
pub mod lock;
pub mod targets;
pub mod task;

use serde::Serialize;

/// Print a document as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
