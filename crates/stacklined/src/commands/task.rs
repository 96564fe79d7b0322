use std::io::Read;
use std::path::Path;

use stackline_tasks::{Step, TaskContext};
use tracing::{error, info};

use super::print_json;

/// Run one step. Failures are printed as `{errorType, errorMessage}` and
/// turn into a non-zero exit.
pub async fn run(ctx: &TaskContext, step: Step, input: Option<&Path>) -> anyhow::Result<()> {
    let raw = match input {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let document: serde_json::Value = if raw.trim().is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(&raw)?
    };

    info!(%step, "running step");
    match ctx.dispatch(step, document).await {
        Ok(output) => print_json(&output),
        Err(e) => {
            error!(%step, error_type = e.error_type(), error = %e, "step failed");
            print_json(&e.to_output())?;
            anyhow::bail!("{step} failed: {}", e.error_type())
        }
    }
}
