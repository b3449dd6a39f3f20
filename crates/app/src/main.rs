// CLI modules
mod cli;
mod logging;
mod state;
mod version;

use clap::{Parser, Subcommand};
use cli::{args::Args, op::Op, Collections, Init, Migrate, Status, Version};

command_enum! {
    (Collections, Collections),
    (Init, Init),
    (Migrate, Migrate),
    (Status, Status),
    (Version, Version),
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let ctx = cli::op::OpContext::new(args.config_path);

    match args.command.execute(&ctx).await {
        Ok(output) => {
            println!("{}", output);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
