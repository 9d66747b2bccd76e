//! Command-line and environment argument parsing (spec §6.4's agent-side
//! variables). Kept in the donor's manual-parsing style (`cli.rs`):
//! `std::env::args()`, a flat `match` over flag names, CLI-args-over-env
//! precedence for everything except the credential, which prefers the
//! environment so it never shows up in `/proc/<pid>/cmdline`.

use anyhow::Context;

pub(crate) struct Args {
    pub name: String,
    pub hub_url: String,
    pub credential: Option<String>,
    pub tls_cert_path: Option<String>,
    pub run_as_user: Option<String>,
    pub shell_override: Option<String>,
    pub auto_restart_shell: bool,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut name = None;
    let mut hub_url = String::new();
    let mut credential = None;
    let mut tls_cert_path = None;
    let mut run_as_user = std::env::var("RUN_AS_USER").ok();
    let mut shell_override = std::env::var("SHELL").ok();
    let mut auto_restart_shell = std::env::var("AUTO_RESTART_SHELL")
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true);

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("nexus-agent {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("nexus-agent - terminal relay PTY agent");
                println!();
                println!("USAGE:");
                println!("    nexus-agent [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --name <NAME>            Display name this agent registers as (required)");
                println!("    --hub-url <URL>          Hub WebSocket URL, e.g. wss://hub:3002/ws/agent");
                println!(
                    "    --credential <TOKEN>     Shared worker credential (prefer WORKER_TOKEN env)"
                );
                println!("    --tls-cert <PATH>        TLS certificate to pin for the hub connection");
                println!("    --run-as-user <USER>     Spawn PTYs as this local user [env: RUN_AS_USER]");
                println!("    --shell <PATH>           Shell to spawn instead of the default preference order [env: SHELL]");
                println!(
                    "    --no-auto-restart-shell  Disable auto-respawn of exited shells [env: AUTO_RESTART_SHELL=0]"
                );
                println!("    -V, --version            Print version and exit");
                println!("    -h, --help               Print this help and exit");
                std::process::exit(0);
            }
            "--name" => {
                i += 1;
                name = Some(args.get(i).context("missing --name value")?.clone());
            }
            "--hub-url" => {
                i += 1;
                hub_url = args.get(i).context("missing --hub-url value")?.clone();
            }
            "--credential" => {
                i += 1;
                credential = Some(args.get(i).context("missing --credential value")?.clone());
            }
            "--tls-cert" => {
                i += 1;
                tls_cert_path = Some(args.get(i).context("missing --tls-cert value")?.clone());
            }
            "--run-as-user" => {
                i += 1;
                run_as_user = Some(args.get(i).context("missing --run-as-user value")?.clone());
            }
            "--shell" => {
                i += 1;
                shell_override = Some(args.get(i).context("missing --shell value")?.clone());
            }
            "--no-auto-restart-shell" => {
                auto_restart_shell = false;
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
        i += 1;
    }

    // The credential is a secret; prefer the environment over a CLI flag,
    // which is visible to any local user via /proc/<pid>/cmdline.
    if let Ok(env_credential) = std::env::var("WORKER_TOKEN") {
        credential = Some(env_credential);
    }

    Ok(Args {
        name: name.context("--name is required")?,
        hub_url,
        credential,
        tls_cert_path,
        run_as_user,
        shell_override,
        auto_restart_shell,
    })
}
