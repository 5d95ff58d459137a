use clap::Parser;

use slimprobe_cli::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = slimprobe_cli::run(cli).await {
        eprintln!("slimprobe: {err}");
        std::process::exit(err.exit_code());
    }
}
