//! The per-SR garbage collection / coalescing worker.

use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use vhdgc_lib::config::RuntimeDirs;
use vhdgc_lib::control::{Session, SocketClient};
use vhdgc_lib::gc;

/// Marks a re-executed background worker.
const ENV_BACKGROUND_WORKER: &str = "VHDGC_BACKGROUND_WORKER";

#[derive(Debug, Parser)]
#[clap(name = "vhdgc", version)]
struct App {
    /// UUID of the storage repository to operate on.
    #[clap(short = 'u', long = "sr-uuid", global = true)]
    sr_uuid: Option<String>,

    /// Detach and run the GC in the background.
    #[clap(short = 'b', long)]
    background: bool,

    /// Run garbage collection and coalescing.
    #[clap(short = 'g', long)]
    gc: bool,

    /// Don't mutate anything, only report what would be done.
    #[clap(long, global = true)]
    dry_run: bool,

    #[clap(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Request a running worker to stop, waiting until it has.
    Abort {
        /// Do nothing if an abort is already pending.
        #[clap(long)]
        soft: bool,
    },
    /// Stop any running worker and unconditionally collect garbage.
    #[clap(name = "gc_force")]
    GcForce {
        /// Continue even if there are VHD errors.
        #[clap(long)]
        force: bool,
        /// Hold the SR lock for the duration.
        #[clap(long)]
        lock_sr: bool,
    },
    /// Report whether a worker is currently active.
    #[clap(name = "get_state")]
    GetState,
    /// Sweep stale per-VDI read-cache files.
    #[clap(name = "cache_cleanup")]
    CacheCleanup {
        /// Remove parent-node caches unused for this many hours.
        #[clap(long, default_value_t = -1)]
        max_age: i64,
    },
    /// LV back-end maintenance on a single VDI
    /// (activate/deactivate/inflate/deflate).
    Debug { cmd: String, vdi_uuid: String },
}

/// SIGTERM sets the process-wide termination flag; every cancellation
/// point in the engine observes it.
fn install_sigterm_handler() {
    let _ = std::thread::spawn(|| {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("failed to set up signal handling: {e}");
                return;
            }
        };
        rt.block_on(async {
            let mut sig =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to create signal stream");
            sig.recv().await;
            tracing::info!("received SIGTERM");
            vhdgc_lib::abort::request_term();
        });
    });
}

/// Re-execute ourselves detached (own session and process group, null
/// stdio). A fresh process trivially starts with clean lock state.
fn spawn_background_worker(sr_uuid: &str, dry_run: bool) -> Result<()> {
    let exe = std::env::current_exe().context("locating own executable")?;
    let mut cmd = Command::new(exe);
    cmd.args(["-u", sr_uuid, "-g"]);
    if dry_run {
        cmd.arg("--dry-run");
    }
    cmd.env(ENV_BACKGROUND_WORKER, "1");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    cmd.process_group(0);
    let child = cmd.spawn().context("spawning background worker")?;
    tracing::info!("background worker started as PID {}", child.id());
    Ok(())
}

fn connect() -> Result<Session> {
    Ok(Arc::new(SocketClient::connect_default()?))
}

fn run() -> Result<()> {
    let args = App::parse();
    let dirs = RuntimeDirs::default();
    let sr_uuid = args
        .sr_uuid
        .as_deref()
        .context("-u <sr-uuid> is required")?;

    if let Some(cmd) = &args.cmd {
        return match cmd {
            Cmd::Abort { soft } => {
                let aborted = gc::abort(sr_uuid, *soft, &dirs)?;
                tracing::info!("abort: {aborted}");
                Ok(())
            }
            Cmd::GcForce { force, lock_sr } => {
                let session = connect()?;
                gc::gc_force(&session, sr_uuid, *force, args.dry_run, *lock_sr, &dirs)
            }
            Cmd::GetState => {
                println!("{}", gc::get_state(sr_uuid, &dirs));
                Ok(())
            }
            Cmd::CacheCleanup { max_age } => {
                let session = connect()?;
                let n = gc::cache_cleanup(&session, sr_uuid, *max_age, &dirs)?;
                println!("{n}");
                Ok(())
            }
            Cmd::Debug { cmd, vdi_uuid } => {
                let session = connect()?;
                gc::debug(&session, sr_uuid, cmd, vdi_uuid, &dirs)
            }
        };
    }

    if !args.gc {
        anyhow::bail!("nothing to do: pass -g or a subcommand");
    }
    if args.background {
        return spawn_background_worker(sr_uuid, args.dry_run);
    }
    // background workers keep the quiet period; direct invocations run
    // immediately
    let immediate = std::env::var_os(ENV_BACKGROUND_WORKER).is_none();
    let session = connect()?;
    gc::gc(
        &session,
        sr_uuid,
        &gc::GcOptions {
            dry_run: args.dry_run,
            immediate,
            dirs,
        },
    )
}

fn main() {
    vhdgc_utils::initialize_tracing();
    install_sigterm_handler();
    if let Err(e) = run() {
        tracing::error!("error: {e:#}");
        std::process::exit(1);
    }
}
