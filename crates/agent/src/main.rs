mod cli;
mod hub_link;
mod pty;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const EXIT_CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = cli::parse_args()?;

    let run_as_user = pty::resolve_target_user(args.run_as_user.as_deref());
    if args.run_as_user.is_some() && run_as_user.is_none() {
        tracing::warn!(
            user = ?args.run_as_user,
            "configured RUN_AS_USER was not found on this host, spawning shells as the agent's own user"
        );
    }

    let policy = pty::SpawnPolicy {
        run_as_user,
        shell_override: args.shell_override,
        auto_restart_shell: args.auto_restart_shell,
    };

    let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = mpsc::channel(EXIT_CHANNEL_CAPACITY);
    let registry = pty::PtyRegistry::new(policy, output_tx, exit_tx);

    tracing::info!(name = %args.name, hub_url = %args.hub_url, "starting nexus-agent");

    let link_config = hub_link::LinkConfig {
        hub_url: args.hub_url,
        name: args.name,
        credential: args.credential,
        tls_cert_path: args.tls_cert_path,
    };

    hub_link::run(link_config, registry, output_rx, exit_rx).await;
    Ok(())
}
