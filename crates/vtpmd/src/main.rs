//! Userspace TPM emulator daemon.
//!
//! Wires the persistence layer, the engine driver, and the serving loops
//! together: parse the option strings, load keys, build the store, bind the
//! data and control sockets, then serve until SHUTDOWN or a signal.

use std::io::Read;
use std::os::fd::FromRawFd;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::{TcpListener, UnixListener};
use tracing::{error, info, warn};

use ctrlchan::{ServeConfig, Service};
use nvstate::{KeyRegistry, NvStore};
use tpmdrv::{StubEngine, TpmDriver, TpmVersion};

mod config;
mod logging;
mod options;
mod pidfile;

use config::{ChannelOptions, ConnSpec};

#[derive(Parser, Debug)]
#[command(name = "vtpmd", about = "Userspace TPM emulator daemon", version)]
struct Cli {
    /// Emulate a TPM 2 instead of a TPM 1.2
    #[arg(long)]
    tpm2: bool,

    /// Logging: file=|fd=|level=|prefix=|truncate
    #[arg(long, value_name = "OPTIONS")]
    log: Option<String>,

    /// State encryption key: file=|fd=|format=|mode=|remove|pwdfile=|pwdfd=|kdf=
    #[arg(long, value_name = "OPTIONS")]
    key: Option<String>,

    /// Migration key, same keys as --key
    #[arg(long = "migration-key", value_name = "OPTIONS")]
    migration_key: Option<String>,

    /// Pid file: file=|fd=
    #[arg(long, value_name = "OPTIONS")]
    pid: Option<String>,

    /// State location: dir=|backend-uri=|mode=|lock|backup|fsync
    #[arg(long, value_name = "OPTIONS")]
    tpmstate: Option<String>,

    /// Control channel: type=|path=|port=|bindaddr=|fd=|terminate
    #[arg(long, value_name = "OPTIONS")]
    ctrl: Option<String>,

    /// Data channel: type=|path=|port=|bindaddr=|fd=|disconnect
    #[arg(long, value_name = "OPTIONS")]
    server: Option<String>,

    /// Locality policy: reject-locality-4|allow-set-locality
    #[arg(long, value_name = "OPTIONS")]
    locality: Option<String>,

    /// Startup overrides: not-need-init|startup-*|disable-auto-shutdown
    #[arg(long, value_name = "OPTIONS")]
    flags: Option<String>,

    /// Syscall filter action: action=none|log|kill
    #[arg(long, value_name = "OPTIONS")]
    seccomp: Option<String>,

    /// Migration behavior: incoming|release-lock-outgoing
    #[arg(long, value_name = "OPTIONS")]
    migration: Option<String>,

    /// TPM 2 profile: name=|profile=|file=|fd=
    #[arg(long, value_name = "OPTIONS")]
    profile: Option<String>,
}

/// Read a whole inherited descriptor into a string, consuming it.
pub(crate) fn read_fd_to_string(fd: i32) -> std::io::Result<String> {
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    let mut out = String::new();
    file.read_to_string(&mut out)?;
    Ok(out)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            eprintln!("vtpmd: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let log_opts =
        cli.log.as_deref().map(config::log_options).transpose()?.unwrap_or_default();
    logging::init(&log_opts)?;

    let version = if cli.tpm2 { TpmVersion::V2 } else { TpmVersion::V12 };

    let mut keys = KeyRegistry::new();
    if let Some(spec) = cli.key.as_deref() {
        keys.set_state_key(config::key_options("--key", spec)?)?;
    }
    if let Some(spec) = cli.migration_key.as_deref() {
        keys.set_migration_key(config::key_options("--migration-key", spec)?)?;
    }

    let store_cfg = config::tpmstate_options(cli.tpmstate.as_deref())?;
    let locality = cli.locality.as_deref().map(config::locality_options).transpose()?.unwrap_or_default();
    let flags = cli.flags.as_deref().map(config::flags_options).transpose()?.unwrap_or_default();
    let migration =
        cli.migration.as_deref().map(config::migration_options).transpose()?.unwrap_or_default();
    let profile = cli.profile.as_deref().map(config::profile_options).transpose()?;
    if let Some(spec) = cli.seccomp.as_deref() {
        // Validated here; the filter itself is installed by the sandboxing
        // layer around this process.
        let action = config::seccomp_options(spec)?;
        info!(?action, "seccomp action requested");
    }
    let pid_opts = cli.pid.as_deref().map(config::pid_options).transpose()?;

    if profile.is_some() && version != TpmVersion::V2 {
        return Err("--profile requires --tpm2".into());
    }

    let server_chan = match cli.server.as_deref() {
        Some(spec) => config::channel_options("--server", spec)?,
        None => config::default_server_channel()?,
    };
    let ctrl_chan =
        cli.ctrl.as_deref().map(|s| config::channel_options("--ctrl", s)).transpose()?;

    let store = Arc::new(NvStore::new(store_cfg, keys)?);
    let driver = TpmDriver::new(
        StubEngine::new(store.clone()),
        store.clone(),
        version,
        !flags.disable_auto_shutdown,
    );

    let serve_cfg = ServeConfig {
        end_on_hup: ctrl_chan.as_ref().is_some_and(|c| c.terminate),
        startup_type: flags.startup_type,
        locality_policy: locality,
        profile_json: profile.map(|p| p.as_json().to_string()),
        lock_storage_on_init: store.config().do_locking,
        release_lock_outgoing: migration.release_lock_outgoing,
    };
    let boot_lock = store.config().do_locking && !migration.incoming;
    let service = Service::new(driver, serve_cfg);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(serve(
        service,
        server_chan,
        ctrl_chan,
        flags.not_need_init,
        boot_lock,
        pid_opts,
    ))
}

async fn serve(
    service: Service<StubEngine>,
    server_chan: ChannelOptions,
    ctrl_chan: Option<ChannelOptions>,
    not_need_init: bool,
    boot_lock: bool,
    pid_opts: Option<config::PidOptions>,
) -> Result<(), Box<dyn std::error::Error>> {
    let data_listener = bind(&server_chan.spec).await?;
    let ctrl_listener = match &ctrl_chan {
        Some(chan) => Some(bind(&chan.spec).await?),
        None => None,
    };

    // Sockets are ready; now the pid is worth announcing.
    let _pidfile = pid_opts.as_ref().map(pidfile::PidFile::create).transpose()?;

    if not_need_init {
        service.init_tpm_with(false, boot_lock).await?;
    }

    let mut stop = service.stop_signal();

    let data_task = {
        let svc = service.clone();
        tokio::spawn(async move { accept_loop(svc, data_listener, false).await })
    };
    let ctrl_task = ctrl_listener.map(|listener| {
        let svc = service.clone();
        tokio::spawn(async move { accept_loop(svc, listener, true).await })
    });

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = stop.changed() => info!("shutdown requested"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = sigterm.recv() => info!("terminated"),
    }

    data_task.abort();
    if let Some(task) = ctrl_task {
        task.abort();
    }
    service.finish().await;
    info!("tpm stopped, exiting");
    Ok(())
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Bind a listener. `fd=` hands over an already-listening UNIX socket.
async fn bind(spec: &ConnSpec) -> std::io::Result<Listener> {
    match spec {
        ConnSpec::Tcp(addr, port) => {
            let listener = TcpListener::bind((addr.as_str(), *port)).await?;
            info!(addr, port, "listening (tcp)");
            Ok(Listener::Tcp(listener))
        }
        ConnSpec::Unix(path) => {
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)?;
            info!(path = %path.display(), "listening (unix)");
            Ok(Listener::Unix(listener))
        }
        ConnSpec::Fd(fd) => {
            let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(*fd) };
            std_listener.set_nonblocking(true)?;
            let listener = UnixListener::from_std(std_listener)?;
            info!(fd, "listening (inherited fd)");
            Ok(Listener::Unix(listener))
        }
    }
}

/// Accept clients one at a time; each connection is served to completion
/// before the next accept.
async fn accept_loop(service: Service<StubEngine>, listener: Listener, ctrl: bool) {
    loop {
        let result = match &listener {
            Listener::Tcp(l) => match l.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, ctrl, "client connected");
                    if ctrl {
                        service.serve_ctrl(stream).await
                    } else {
                        service.serve_data(stream).await
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
            Listener::Unix(l) => match l.accept().await {
                Ok((stream, _)) => {
                    info!(ctrl, "client connected");
                    if ctrl {
                        service.serve_ctrl(stream).await
                    } else {
                        service.serve_data(stream).await
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        if let Err(e) = result {
            warn!(error = %e, "connection ended with error");
        }
    }
}
