//! vserial - host CLI for the virtio-serial RPC channel.
//!
//! Exit codes: 0 success, 1 protocol/usage error, 2 connection error,
//! 3 server-reported business error. `exec` exits with the remote
//! command's own exit code.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vserial_host::error::ClientError;
use vserial_host::{Client, HostConfig};
use vserial_proto::error::TransportError;

#[derive(Parser)]
#[command(name = "vserial")]
#[command(about = "CLI for the vserial guest agent", long_about = None)]
struct Cli {
    /// Unix socket of the virtio-serial channel
    #[arg(short, long, default_value = "/var/lib/libvirt/qemu/channel/target/org.vserial.0")]
    socket: PathBuf,

    /// Request timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check guest liveness
    Ping,

    /// Print guest system information as JSON
    Info,

    /// Run a command on the guest and print its output
    Exec {
        /// Command line, vetted against the guest allow-list
        command: String,
    },

    /// Upload a local file to the guest (MD5-verified)
    Upload {
        local: PathBuf,
        remote: String,
    },

    /// Download a guest file (MD5-verified)
    Download {
        remote: String,
        local: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = Client::new(HostConfig::for_socket(cli.socket));

    match run(&client, cli.command, cli.timeout).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(classify(&e))
        }
    }
}

fn classify(e: &ClientError) -> u8 {
    match e {
        ClientError::Transport(TransportError::ConnectionRefused(_))
        | ClientError::Transport(TransportError::ConnectionLost(_))
        | ClientError::Transport(TransportError::Timeout)
        | ClientError::Transport(TransportError::NotConnected) => 2,
        ClientError::Server { .. } => 3,
        ClientError::Protocol(_) | ClientError::Decode(_) | ClientError::Local(_) => 1,
    }
}

async fn run(
    client: &Client,
    command: Commands,
    timeout: Option<u64>,
) -> Result<ExitCode, ClientError> {
    match command {
        Commands::Ping => {
            let env = client.ping().await?;
            println!(
                "pong (uptime {}s)",
                env.data["uptime"].as_u64().unwrap_or(0)
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Info => {
            let data = client.get_system_info().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&data).unwrap_or_else(|_| data.to_string())
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Exec { command } => {
            let result = client.exec_command(&command, timeout).await?;
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            let code = u8::try_from(result.exit_code).unwrap_or(1);
            Ok(ExitCode::from(code))
        }

        Commands::Upload { local, remote } => {
            let report = client.upload_file(&local, &remote).await?;
            println!("uploaded {} bytes (md5 {})", report.bytes, report.md5);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Download { remote, local } => {
            let report = client.download_file(&remote, &local).await?;
            println!("downloaded {} bytes (md5 {})", report.bytes, report.md5);
            Ok(ExitCode::SUCCESS)
        }
    }
}
