use crate::commands::context::open_database;
use crate::commands::{execute, CommandOutput, CommandResult};

pub fn run() -> CommandResult {
    execute("migrate", |config| async move {
        let pool = open_database(&config).await?;
        pool.close().await;
        Ok(CommandOutput::message("applied pending migrations"))
    })
}
