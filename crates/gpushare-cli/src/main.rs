//! gpushare CLI
//!
//! Command-line interface for queuing on shared GPUs.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// gpushare - queue for exclusive use of shared GPUs
#[derive(Parser, Debug)]
#[command(name = "gpushare")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: String,

    /// Username to act as (defaults to $USER)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Header the daemon reads the username from
    #[arg(long, default_value = "x-remote-user", global = true)]
    user_header: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List devices and their GPUs
    Devices,

    /// Show one device in detail, or the daemon status
    Status {
        /// Device name (shows the daemon status if not provided)
        device: Option<String>,
    },

    /// Queue for a specific GPU
    Reserve {
        /// GPU uuid
        gpu: String,
    },

    /// Take the next GPU that frees up on a device
    ReserveNext {
        /// Device name
        device: String,
    },

    /// Give up a GPU you hold
    Release {
        /// GPU uuid
        gpu: String,
        /// Reservation ID
        reservation: Uuid,
    },

    /// Leave a queue you are waiting in
    Cancel {
        /// GPU uuid
        gpu: String,
        /// Reservation ID
        reservation: Uuid,
    },

    /// Renew the usage window of a GPU you hold
    Extend {
        /// GPU uuid
        gpu: String,
        /// Reservation ID
        reservation: Uuid,
    },

    /// Show your place in a GPU's queue
    Position {
        /// GPU uuid
        gpu: String,
    },

    /// Send a message to other users
    Message {
        /// Recipient username (repeatable)
        #[arg(long = "to", required_unless_present = "all")]
        to: Vec<String>,
        /// Message every user (staff only)
        #[arg(long, conflicts_with = "to")]
        all: bool,
        /// Subject line
        #[arg(short, long)]
        subject: String,
        /// Message text
        body: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let user = cli.user.or_else(|| std::env::var("USER").ok());
    let client = commands::ApiClient::new(&cli.api, &cli.user_header, user);

    match cli.command {
        Commands::Devices => {
            commands::devices(&client).await?;
        }
        Commands::Status { device } => {
            commands::status(&client, device).await?;
        }
        Commands::Reserve { gpu } => {
            commands::reserve(&client, gpu).await?;
        }
        Commands::ReserveNext { device } => {
            commands::reserve_next(&client, device).await?;
        }
        Commands::Release { gpu, reservation } => {
            commands::release(&client, gpu, reservation).await?;
        }
        Commands::Cancel { gpu, reservation } => {
            commands::cancel(&client, gpu, reservation).await?;
        }
        Commands::Extend { gpu, reservation } => {
            commands::extend(&client, gpu, reservation).await?;
        }
        Commands::Position { gpu } => {
            commands::position(&client, gpu).await?;
        }
        Commands::Message {
            to,
            all,
            subject,
            body,
        } => {
            let request = commands::MessageRequest {
                recipients: to,
                all_users: all,
                subject,
                body,
            };
            commands::message(&client, &request).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_needs_recipients_or_all() {
        let cli = Cli::try_parse_from([
            "gpushare", "message", "--to", "bob", "--to", "carol", "-s", "Hi", "Done soon?",
        ])
        .unwrap();
        let Commands::Message { to, all, .. } = cli.command else {
            panic!("expected the message command");
        };
        assert_eq!(to, vec!["bob", "carol"]);
        assert!(!all);

        assert!(Cli::try_parse_from(["gpushare", "message", "--all", "-s", "Hi", "text"]).is_ok());
        assert!(Cli::try_parse_from(["gpushare", "message", "-s", "Hi", "text"]).is_err());
        assert!(Cli::try_parse_from([
            "gpushare", "message", "--all", "--to", "bob", "-s", "Hi", "text"
        ])
        .is_err());
    }
}
