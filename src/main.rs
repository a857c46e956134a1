//! Soulseek test client
//!
//! Minimal CLI for exercising the library against the live network: log in,
//! run a search, browse a user, or pull a single file.

use clap::Parser;
use slsk::{ClientEvent, ClientOptions, NoShareHost, SoulseekClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slsk", version, about = "Soulseek protocol test client")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "server.slsknet.org:2242")]
    server: String,

    /// Account name
    #[arg(short, long)]
    username: String,

    /// Account password
    #[arg(short, long)]
    password: String,

    /// Optional TOML options file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port for inbound peer connections
    #[arg(long)]
    listen_port: Option<u16>,

    /// Stay out of the distributed search tree
    #[arg(long)]
    no_distributed: bool,

    /// Run a search and print responses for a while
    #[arg(long)]
    search: Option<String>,

    /// Browse a user's share listing
    #[arg(long)]
    browse: Option<String>,

    /// Download "<user> <remote\\path\\file> <local path>"
    #[arg(long, num_args = 3, value_names = ["USER", "REMOTE", "LOCAL"])]
    download: Option<Vec<String>>,

    /// How long to keep collecting asynchronous responses, in seconds
    #[arg(long, default_value = "30")]
    linger: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut options = match &args.config {
        Some(path) => match std::fs::read_to_string(path).map(|s| toml::from_str(&s)) {
            Ok(Ok(options)) => options,
            Ok(Err(e)) => {
                eprintln!("bad config {}: {e}", path.display());
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("cannot read {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => ClientOptions::default(),
    };
    if let Some(port) = args.listen_port {
        options.listen_port = port;
    }
    if args.no_distributed {
        options.enable_distributed_network = false;
        options.accept_distributed_children = false;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(options.minimum_diagnostic_level.as_filter())),
        )
        .init();

    if let Err(e) = run(args, options).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args, options: ClientOptions) -> slsk::Result<()> {
    let client = SoulseekClient::new(options, Arc::new(NoShareHost))?;
    let mut events = client.subscribe();

    client.connect(&args.server).await?;
    let greeting = client.login(&args.username, &args.password).await?;
    info!("logged in: {}", greeting.trim());

    if let Some(query) = &args.search {
        let token = client.search(query).await?;
        info!(token, "search sent, collecting responses");
    }

    if let Some(username) = &args.browse {
        let listing = client.browse(username).await?;
        let files: usize = listing.directories.iter().map(|d| d.files.len()).sum();
        println!(
            "{username}: {} directories, {files} files",
            listing.directories.len()
        );
        for directory in listing.directories.iter().take(25) {
            println!("  {} ({} files)", directory.name, directory.files.len());
        }
    }

    if let Some(parts) = &args.download {
        let (user, remote, local) = (&parts[0], &parts[1], PathBuf::from(&parts[2]));
        info!(%user, %remote, "download starting");
        let transfer = client.download(user, remote, &local, None, None).await?;
        println!(
            "downloaded {} bytes to {}",
            transfer.bytes_transferred,
            local.display()
        );
    }

    let deadline = tokio::time::sleep(Duration::from_secs(args.linger));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(ClientEvent::SearchResponse { token, response }) => {
                    println!(
                        "[{token}] {} ({} files, {} free slots)",
                        response.username,
                        response.files.len(),
                        response.has_free_slots
                    );
                    for file in response.files.iter().take(5) {
                        println!("    {} ({} bytes)", file.filename, file.size);
                    }
                }
                Some(ClientEvent::PrivateMessage { username, message, .. }) => {
                    println!("<{username}> {message}");
                }
                Some(ClientEvent::ParentAdopted { username, branch_level, .. }) => {
                    info!(%username, branch_level, "joined distributed branch");
                }
                Some(_) => {}
                None => break,
            }
        }
    }

    client.disconnect("shutting down").await;
    Ok(())
}
