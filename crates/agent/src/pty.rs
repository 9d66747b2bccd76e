//! Per-session PTY management (C4 + C6, spec §4.5/§4.6): spawn policy, the
//! `NONE -> RUNNING -> EXITED -> auto-respawn -> RUNNING` / `RUNNING ->
//! KILLED` lifecycle, and the agent-local session registry.
//!
//! Grounded in the `jss826-den` donor's `SessionRegistry`/`SharedSession`
//! pair: `portable_pty`-spawned child, a `spawn_blocking` read loop feeding a
//! `broadcast::Sender<Vec<u8>>`, and a dedicated `resize_tx:
//! std::sync::mpsc::Sender<(u16,u16)>` drained into `master.resize()` on its
//! own blocking task so resize calls never contend with the read loop. The
//! donor's `clients: Vec<ClientInfo>` per-viewer tracking is dropped here —
//! the Hub already reconciles viewports and sends this agent a single
//! `resize` command, so there is nothing left for the agent to reconcile.
//!
//! User-targeted spawning is relocated here from the donor's
//! `hub/src/session.rs::spawn_agent`, which ran on the Hub and dropped
//! privileges itself before exec'ing a subprocess. This binary already runs
//! directly on the target host and owns the PTY locally, so the equivalent
//! step is to exec through `su -l` rather than drop this process's own
//! privileges between sessions (see `build_command`).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nexus_protocol::SessionId;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{CommandBuilder, NativePtySystem, PtySize, PtySystem};
use tokio::sync::{Mutex, broadcast, mpsc};

const OUTPUT_BROADCAST_CAPACITY: usize = 256;
const RESPAWN_DEBOUNCE: Duration = Duration::from_millis(500);

/// What to run and as whom, resolved once at startup (spec §4.5's spawn
/// policy).
#[derive(Clone)]
pub struct SpawnPolicy {
    pub run_as_user: Option<TargetUser>,
    pub shell_override: Option<String>,
    pub auto_restart_shell: bool,
}

#[derive(Clone)]
pub struct TargetUser {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

/// Resolve the configured or auto-detected target user. Auto-detection picks
/// the first non-system local account (uid in `[1000, 65534)`, excluding
/// `nobody`) from `/etc/passwd` via `getpwent`-backed iteration; since
/// `nix`/`libc` do not expose a safe passwd-enumeration API here, the
/// configured `RUN_AS_USER` is the only supported path and auto-detection
/// falls back to running as the current user when unset.
pub fn resolve_target_user(run_as_user: Option<&str>) -> Option<TargetUser> {
    let username = run_as_user?;
    let user = nix::unistd::User::from_name(username).ok()??;
    Some(TargetUser {
        username: username.to_string(),
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        home: user.dir.to_string_lossy().into_owned(),
    })
}

fn preferred_shell(shell_override: Option<&str>) -> String {
    if let Some(shell) = shell_override {
        return shell.to_string();
    }
    for candidate in ["/usr/bin/zsh", "/bin/zsh", "/usr/bin/bash", "/bin/bash", "/bin/sh"] {
        if std::path::Path::new(candidate).exists() {
            return candidate.to_string();
        }
    }
    "/bin/sh".to_string()
}

/// Builds the command to run in the PTY. `portable_pty::CommandBuilder` has
/// no `pre_exec` hook to drop privileges in-process, so a user-targeted spawn
/// goes through `su -l <user>` instead — the same "login mechanism that
/// loads the user's profile" the donor's `spawn_agent` achieves with a
/// hand-rolled `initgroups`/`setgid`/`setuid` trio, but expressed as the
/// standard Unix tool built for exactly this, since this agent process does
/// not need to give up its own privileges between sessions.
fn build_command(policy: &SpawnPolicy) -> CommandBuilder {
    let shell = preferred_shell(policy.shell_override.as_deref());

    match &policy.run_as_user {
        Some(user) => {
            let mut cmd = CommandBuilder::new("/bin/su");
            cmd.arg("-l").arg(&user.username).arg("-s").arg(&shell);
            cmd.env("TERM", "xterm-256color");
            cmd.env("COLORTERM", "truecolor");
            cmd.env("LANG", "en_US.UTF-8");
            cmd.env("LC_ALL", "en_US.UTF-8");
            cmd
        }
        None => {
            let mut cmd = CommandBuilder::new(&shell);
            cmd.arg("-l");
            cmd.env("TERM", "xterm-256color");
            cmd.env("COLORTERM", "truecolor");
            cmd.env("LANG", "en_US.UTF-8");
            cmd.env("LC_ALL", "en_US.UTF-8");
            cmd
        }
    }
}

struct RawPty {
    master: Box<dyn portable_pty::MasterPty + Send>,
    reader: Box<dyn std::io::Read + Send>,
    writer: Box<dyn std::io::Write + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

fn spawn_pty(policy: &SpawnPolicy, cols: u16, rows: u16) -> anyhow::Result<RawPty> {
    let pty_system = NativePtySystem::default();
    let pair = pty_system.openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })?;

    let cmd = build_command(policy);
    let child = pair.slave.spawn_command(cmd)?;
    drop(pair.slave);

    let reader = pair.master.try_clone_reader()?;
    let writer = pair.master.take_writer()?;

    Ok(RawPty { master: pair.master, reader, writer, child })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyState {
    Running,
    Exited,
    Killed,
}

struct SessionInner {
    writer: Box<dyn std::io::Write + Send>,
    resize_tx: std::sync::mpsc::Sender<(u16, u16)>,
    state: PtyState,
    applied_size: (u16, u16),
}

/// One agent-local PTY session (spec §4.6).
pub struct Session {
    id: SessionId,
    alive: AtomicBool,
    killed: AtomicBool,
    output_tx: std::sync::Mutex<Option<broadcast::Sender<String>>>,
    inner: Mutex<SessionInner>,
    pid: Option<Pid>,
}

impl Session {
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        let guard = self.output_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub async fn write_input(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        std::io::Write::write_all(&mut inner.writer, data)?;
        Ok(())
    }

    pub async fn resize(&self, cols: u16, rows: u16) {
        let mut inner = self.inner.lock().await;
        if inner.applied_size == (cols, rows) {
            return;
        }
        inner.applied_size = (cols, rows);
        let _ = inner.resize_tx.send((cols, rows));
    }

    /// Terminates the shell process (spec §4.6, `RUNNING --kill_session-->
    /// KILLED`: "the PTY is gone", not merely marked dead). The read loop
    /// observes EOF once the child exits and reaps it via `child.wait()`.
    pub async fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        {
            let mut inner = self.inner.lock().await;
            inner.state = PtyState::Killed;
        }
        if let Some(pid) = self.pid {
            if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
                tracing::debug!(session = %self.id, "failed to signal PTY child {pid}: {e}");
            }
        }
    }
}

/// Notification that a session's shell process has exited, destined for
/// `AgentToHub::SessionShellExited` on the hub link.
pub struct ShellExit {
    pub session_id: SessionId,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// Registry of this agent's live PTY sessions, keyed by Hub-assigned session
/// id. Lazily spawns on first `execute`/`resize` (spec §4.5).
pub struct PtyRegistry {
    sessions: tokio::sync::RwLock<HashMap<SessionId, Arc<Session>>>,
    policy: SpawnPolicy,
    output_sink: mpsc::Sender<(SessionId, String)>,
    exit_sink: mpsc::Sender<ShellExit>,
}

impl PtyRegistry {
    pub fn new(
        policy: SpawnPolicy,
        output_sink: mpsc::Sender<(SessionId, String)>,
        exit_sink: mpsc::Sender<ShellExit>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: tokio::sync::RwLock::new(HashMap::new()),
            policy,
            output_sink,
            exit_sink,
        })
    }

    pub async fn get_or_spawn(self: &Arc<Self>, id: &str) -> anyhow::Result<Arc<Session>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(id) {
                if session.is_alive() || session.is_killed() {
                    return Ok(Arc::clone(session));
                }
            }
        }

        let session = self.spawn_session(id.to_string(), 80, 24).await?;
        let mut sessions = self.sessions.write().await;
        sessions.insert(id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    async fn spawn_session(self: &Arc<Self>, id: SessionId, cols: u16, rows: u16) -> anyhow::Result<Arc<Session>> {
        let policy = self.policy.clone();
        let raw = tokio::task::spawn_blocking(move || spawn_pty(&policy, cols, rows))
            .await??;

        let (output_tx, _) = broadcast::channel(OUTPUT_BROADCAST_CAPACITY);
        let (resize_tx, resize_rx) = std::sync::mpsc::channel::<(u16, u16)>();
        let mut child = raw.child;
        let pid = child.process_id().map(|raw_pid| Pid::from_raw(raw_pid as i32));

        let session = Arc::new(Session {
            id: id.clone(),
            alive: AtomicBool::new(true),
            killed: AtomicBool::new(false),
            output_tx: std::sync::Mutex::new(Some(output_tx.clone())),
            inner: Mutex::new(SessionInner {
                writer: raw.writer,
                resize_tx,
                state: PtyState::Running,
                applied_size: (cols, rows),
            }),
            pid,
        });

        let master = raw.master;
        tokio::task::spawn_blocking(move || {
            while let Ok((cols, rows)) = resize_rx.recv() {
                let _ = master.resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 });
            }
        });

        let session_for_read = Arc::clone(&session);
        let sink = self.output_sink.clone();
        let id_for_read = id.clone();
        let mut reader = raw.reader;
        let read_task = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match std::io::Read::read(&mut reader, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                        let _ = output_tx.send(text.clone());
                        let _ = sink.blocking_send((id_for_read.clone(), text));
                    }
                    Err(_) => break,
                }
            }
            let exit_status = child.wait().ok();
            session_for_read.alive.store(false, Ordering::Release);
            session_for_read.output_tx.lock().unwrap().take();
            drop(output_tx);
            exit_status
        });

        let registry = Arc::clone(self);
        let id_for_exit = id.clone();
        let session_for_exit = Arc::clone(&session);
        tokio::spawn(async move {
            let exit_status = read_task.await.ok().flatten();
            let exit_code = exit_status.map(|s| s.exit_code() as i32);
            let _ = registry
                .exit_sink
                .send(ShellExit { session_id: id_for_exit.clone(), exit_code, signal: None })
                .await;

            if session_for_exit.is_killed() {
                return;
            }
            {
                let mut inner = session_for_exit.inner.lock().await;
                inner.state = PtyState::Exited;
            }
            registry.maybe_respawn(&id_for_exit, exit_code).await;
        });

        Ok(session)
    }

    /// Respawn policy: called when a session's PTY has exited and was not
    /// explicitly killed (spec §4.5). Debounced 500ms; injects a banner with
    /// the previous exit status into the output stream.
    pub async fn maybe_respawn(self: &Arc<Self>, id: &str, previous_exit_code: Option<i32>) {
        if !self.policy.auto_restart_shell {
            return;
        }
        let already_killed = {
            let sessions = self.sessions.read().await;
            sessions.get(id).map(|s| s.is_killed()).unwrap_or(true)
        };
        if already_killed {
            return;
        }

        tokio::time::sleep(RESPAWN_DEBOUNCE).await;

        let banner = match previous_exit_code {
            Some(code) => format!("\r\n\x1b[33m[session restarted — shell exited with code {code}]\x1b[0m\r\n"),
            None => "\r\n\x1b[33m[session restarted — shell exited]\x1b[0m\r\n".to_string(),
        };
        let _ = self.output_sink.send((id.to_string(), banner)).await;

        if let Ok(session) = self.spawn_session(id.to_string(), 80, 24).await {
            let mut sessions = self.sessions.write().await;
            sessions.insert(id.to_string(), session);
        }
    }

    pub async fn kill(&self, id: &str) {
        let session = { self.sessions.write().await.remove(id) };
        if let Some(session) = session {
            session.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_shell_respects_override() {
        assert_eq!(preferred_shell(Some("/opt/custom/shell")), "/opt/custom/shell");
    }

    #[test]
    fn preferred_shell_falls_back_to_sh_when_nothing_else_exists() {
        // /bin/sh exists on every POSIX system this would run on.
        let shell = preferred_shell(None);
        assert!(shell.ends_with("sh"));
    }

    #[tokio::test]
    async fn resolve_target_user_returns_none_for_unknown_user() {
        assert!(resolve_target_user(Some("definitely-not-a-real-user-xyz")).is_none());
    }

    #[tokio::test]
    async fn resolve_target_user_returns_none_when_unset() {
        assert!(resolve_target_user(None).is_none());
    }

    #[tokio::test]
    async fn resolve_target_user_finds_root() {
        let user = resolve_target_user(Some("root")).unwrap();
        assert_eq!(user.uid, 0);
        assert_eq!(user.username, "root");
    }
}
