use crate::cli::actions::{check, server, Action};
use anyhow::Result;

/// Execute the provided action.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<()> {
    match action {
        Action::Run(args) => server::execute(args).await,
        Action::Check(args) => check::execute(&args),
    }
}
