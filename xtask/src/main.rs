use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the co2mon workspace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build,
    /// Run the monitor CLI, passing any extra arguments through
    Run {
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Run all tests
    Test,
}

fn cargo(args: &[&str]) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("cargo {} failed", args.join(" "));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building workspace...");
            cargo(&["build", "--workspace"])?;
        }
        Commands::Run { args } => {
            println!("Running co2mon...");
            let mut cmd = vec!["run", "-p", "co2mon-cli", "--"];
            cmd.extend(args.iter().map(String::as_str));
            cargo(&cmd)?;
        }
        Commands::Test => {
            println!("Testing workspace...");
            cargo(&["test", "--workspace"])?;
        }
    }

    Ok(())
}
