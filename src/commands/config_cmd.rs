use clap::{Args, Subcommand, ValueEnum};

use crate::config::Config;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(config)?);
                }
                OutputFormat::Text => print_text(config),
            },
        }
        Ok(())
    }
}

fn print_text(config: &Config) {
    println!("Configuration");
    println!("=============\n");

    if let Some(path) = &config.config_file {
        println!("Config file: {}", path.display());
    } else {
        println!(
            "Config file: {} (not found)",
            Config::default_config_path().display()
        );
    }
    println!();

    println!("database_path: {}", config.database_path.value.display());
    println!("  source: {}", config.database_path.source);
    println!();

    println!("authority: {}", config.authority.value);
    println!("  source: {}", config.authority.source);
    println!();

    match config.timeout() {
        Some(timeout) => println!("timeout_secs: {}", timeout.as_secs()),
        None => println!("timeout_secs: 0 (no limit)"),
    }
    println!("  source: {}", config.timeout_secs.source);
    println!();

    match &config.summary_dir.value {
        Some(dir) => println!("summary_dir: {}", dir.display()),
        None => println!("summary_dir: (not set)"),
    }
    println!("  source: {}", config.summary_dir.source);
    println!();

    match &config.backup_dir.value {
        Some(dir) => println!("backup_dir: {}", dir.display()),
        None => println!("backup_dir: (not set)"),
    }
    println!("  source: {}", config.backup_dir.source);
    println!();

    println!(
        "server.server_url: {}",
        config.server.server_url.as_deref().unwrap_or("(not set)")
    );
    println!(
        "server.api_key: {}",
        if config.server.api_key.is_some() {
            "(set)"
        } else {
            "(not set)"
        }
    );
}
