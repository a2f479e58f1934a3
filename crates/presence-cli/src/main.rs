use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "presence", about = "Presence check-in kiosk CLI")]
struct Cli {
    /// Talk to the daemon on the session bus instead of the system bus.
    #[arg(long)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Reload the gallery from the store
    Refresh,
    /// Empty the in-RAM gallery (tenant logout)
    Clear,
    /// Enroll a new identity from an embedding file
    Enroll {
        /// Stable identity ID (e.g., a student number)
        #[arg(short, long)]
        identity: String,
        /// Display name shown on the kiosk
        #[arg(short, long)]
        name: String,
        /// Path to a JSON file holding the 192-float embedding
        #[arg(short, long)]
        embedding_file: String,
    },
    /// List enrolled profiles
    List,
    /// Remove an enrolled profile
    Remove {
        /// Identity ID to remove
        identity: String,
    },
    /// Show recent check-ins
    Checkins {
        /// Maximum records to show
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Cancel any in-progress check-in session
    Reset,
}

#[zbus::proxy(
    interface = "org.freedesktop.Presence1",
    default_service = "org.freedesktop.Presence1",
    default_path = "/org/freedesktop/Presence1"
)]
trait Presence {
    async fn status(&self) -> zbus::Result<String>;
    async fn refresh_gallery(&self) -> zbus::Result<u32>;
    async fn clear_gallery(&self) -> zbus::Result<()>;
    async fn enroll(
        &self,
        identity_id: &str,
        display_name: &str,
        embedding_json: &str,
    ) -> zbus::Result<String>;
    async fn list_profiles(&self) -> zbus::Result<String>;
    async fn remove_profile(&self, identity_id: &str) -> zbus::Result<bool>;
    async fn recent_checkins(&self, limit: u32) -> zbus::Result<String>;
    async fn force_reset(&self) -> zbus::Result<()>;
}

/// Pretty-print a JSON string, falling back to the raw text.
fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default()),
        Err(_) => println!("{raw}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus — is presenced running?")?;
    let proxy = PresenceProxy::new(&conn).await?;

    match cli.command {
        Commands::Status => {
            print_json(&proxy.status().await?);
        }
        Commands::Refresh => {
            let count = proxy.refresh_gallery().await?;
            println!("gallery refreshed: {count} profiles");
        }
        Commands::Clear => {
            proxy.clear_gallery().await?;
            println!("gallery cleared");
        }
        Commands::Enroll {
            identity,
            name,
            embedding_file,
        } => {
            let embedding_json = std::fs::read_to_string(&embedding_file)
                .with_context(|| format!("failed to read {embedding_file}"))?;
            let id = proxy.enroll(&identity, &name, &embedding_json).await?;
            println!("enrolled: {id}");
        }
        Commands::List => {
            print_json(&proxy.list_profiles().await?);
        }
        Commands::Remove { identity } => {
            if proxy.remove_profile(&identity).await? {
                println!("removed: {identity}");
            } else {
                println!("not found: {identity}");
            }
        }
        Commands::Checkins { limit } => {
            print_json(&proxy.recent_checkins(limit).await?);
        }
        Commands::Reset => {
            proxy.force_reset().await?;
            println!("session reset");
        }
    }

    Ok(())
}
