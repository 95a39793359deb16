use clap::Parser;

#[derive(Parser)]
pub struct Cli {
    /// Port to bind the HTTP and worker WebSocket surface on.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
}
