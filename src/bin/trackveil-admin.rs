use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use trackveil::config::{Config, DatabaseBackend};
use trackveil::models::{Account, SiteId};
use trackveil::storage::{PostgresStorage, SqliteStorage, Storage, StorageError};

/// Fresh ids collide with probability ~62^-32, so a few attempts suffice
const MAX_SITE_ID_ATTEMPTS: usize = 5;

#[derive(Parser)]
#[command(name = "trackveil-admin")]
#[command(about = "Trackveil site provisioning CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new site and print its tracking snippet
    CreateSite {
        /// Site name
        #[arg(long)]
        name: String,
        /// Site domain
        #[arg(long)]
        domain: String,
        /// Account name (created if it does not exist)
        #[arg(long, conflicts_with = "account_id", required_unless_present = "account_id")]
        account: Option<String>,
        /// Existing account ID
        #[arg(long)]
        account_id: Option<String>,
        /// Tracker script location used in the printed snippet
        #[arg(long, default_value = "https://cdn.trackveil.net/tracker.js")]
        script_url: String,
    },
    /// List all accounts with their site counts
    ListAccounts,
    /// List registered sites
    ListSites {
        /// Only show sites of this account
        #[arg(long)]
        account_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let storage: Arc<dyn Storage> = match config.database.backend {
        DatabaseBackend::Sqlite => Arc::new(
            SqliteStorage::new(&config.database.url, config.database.max_connections).await?,
        ),
        DatabaseBackend::Postgres => Arc::new(
            PostgresStorage::new(&config.database.url, config.database.max_connections).await?,
        ),
    };

    // Ensure database is initialized
    storage.init().await?;

    match cli.command {
        Commands::CreateSite {
            name,
            domain,
            account,
            account_id,
            script_url,
        } => {
            let account = resolve_account(storage.as_ref(), account, account_id).await?;
            let site_id = create_site(storage.as_ref(), &account.id, &name, &domain).await?;

            println!();
            println!("{}", "=".repeat(60));
            println!("✓ Site created successfully!");
            println!("{}", "=".repeat(60));
            println!();
            println!("Site ID: {}", site_id);
            println!("Name: {}", name);
            println!("Domain: {}", domain);
            println!("Account ID: {}", account.id);
            println!();
            println!("Add this snippet to your website:");
            println!("{}", "-".repeat(40));
            println!(
                "<script async src=\"{}\"\n        data-site-id=\"{}\"></script>",
                script_url, site_id
            );
            println!("{}", "=".repeat(60));
        }
        Commands::ListAccounts => {
            let accounts = storage.list_accounts().await?;
            if accounts.is_empty() {
                println!("No accounts found.");
            } else {
                println!("{:<38} {:<30} {}", "Account ID", "Name", "Sites");
                println!("{}", "-".repeat(80));
                for account in accounts {
                    println!(
                        "{:<38} {:<30} {}",
                        account.id, account.name, account.site_count
                    );
                }
            }
        }
        Commands::ListSites { account_id } => {
            let sites = storage.list_sites(account_id.as_deref()).await?;
            if sites.is_empty() {
                println!("No sites found.");
            } else {
                println!("{:<34} {:<30} {}", "Site ID", "Domain", "Name");
                println!("{}", "-".repeat(90));
                for site in sites {
                    println!("{:<34} {:<30} {}", site.id, site.domain, site.name);
                }
            }
        }
    }

    Ok(())
}

async fn resolve_account(
    storage: &dyn Storage,
    account_name: Option<String>,
    account_id: Option<String>,
) -> Result<Account> {
    match (account_name, account_id) {
        (_, Some(id)) => storage
            .get_account(&id)
            .await?
            .with_context(|| format!("account '{}' not found", id)),
        (Some(name), None) => match storage.find_account_by_name(&name).await? {
            Some(account) => {
                println!("✓ Using existing account: {} (ID: {})", account.name, account.id);
                Ok(account)
            }
            None => {
                let account = storage.create_account(&name).await?;
                println!("✓ Created new account: {} (ID: {})", account.name, account.id);
                Ok(account)
            }
        },
        (None, None) => bail!("either --account or --account-id is required"),
    }
}

async fn create_site(
    storage: &dyn Storage,
    account_id: &str,
    name: &str,
    domain: &str,
) -> Result<SiteId> {
    for _ in 0..MAX_SITE_ID_ATTEMPTS {
        let site_id = SiteId::generate();
        match storage
            .create_site(site_id.as_str(), account_id, name, domain)
            .await
        {
            Ok(_) => return Ok(site_id),
            Err(StorageError::Conflict) => {
                tracing::warn!("generated site id already taken, retrying");
            }
            Err(StorageError::Other(err)) => return Err(err),
        }
    }

    bail!(
        "failed to generate an unused site id after {} attempts",
        MAX_SITE_ID_ATTEMPTS
    )
}
