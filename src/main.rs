use legends_osi::cli::CommandLineInterface;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn,legends_osi=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let command_line_interface = CommandLineInterface::load();
    command_line_interface.run()
}
