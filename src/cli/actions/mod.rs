pub mod check;
pub mod server;

// Single dispatch point, kept apart so this file only lists the actions.
mod run;

#[derive(Debug)]
pub enum Action {
    Run(server::Args),
    Check(check::Args),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        run::execute(self).await
    }
}
