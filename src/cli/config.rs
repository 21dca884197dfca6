use clap::{Args, Subcommand};

use super::CliContext;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Add a key to the root `.env`
    Add { key: String, value: String },
    /// Overwrite an existing key
    Update { key: String, value: String },
    /// Remove a key
    Delete { key: String },
}

pub async fn execute(args: ConfigArgs, context: &CliContext) -> anyhow::Result<()> {
    let store = &context.config_manager.0;
    match args.command {
        ConfigCommands::Add { key, value } => match store.set(&key, &value).await {
            Ok(()) => println!("✅ {key} added."),
            Err(e) => eprintln!("❌ {key} could not be added: {e}"),
        },
        ConfigCommands::Update { key, value } => {
            if store.get(&key).await.is_none() {
                eprintln!("❌ {key} is not set; use `config add`.");
                return Ok(());
            }
            match store.set(&key, &value).await {
                Ok(()) => println!("✅ {key} updated."),
                Err(e) => eprintln!("❌ {key} could not be updated: {e}"),
            }
        }
        ConfigCommands::Delete { key } => {
            store.del(&key).await;
            println!("✅ {key} deleted.");
        }
    }
    Ok(())
}
