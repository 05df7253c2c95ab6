//! Typed configuration built from the CLI option strings.

use std::path::PathBuf;

use nvstate::{keys, EncryptionMode, KdfId, KeyFormat, StoreConfig, SymKey};
use tpmdrv::{wire, LocalityPolicy, Profile};

use crate::options::{opt, parse, OptError, OptKind, OptionDesc, OptionValues};

/// Environment variable supplying the default state directory.
pub const TPM_PATH_ENV: &str = "TPM_PATH";
/// Environment variable supplying the default server TCP port.
pub const TPM_PORT_ENV: &str = "TPM_PORT";

/// Configuration errors, all fatal before serving starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Malformed option string.
    #[error("{flag}: {source}")]
    Option {
        /// The CLI flag at fault.
        flag: &'static str,
        /// The underlying parse error.
        source: OptError,
    },
    /// Key loading or store validation failure.
    #[error("{flag}: {source}")]
    Nv {
        /// The CLI flag at fault.
        flag: &'static str,
        /// The underlying persistence error.
        source: nvstate::NvError,
    },
    /// Profile rejection.
    #[error("profile: {0}")]
    Profile(tpmdrv::DrvError),
    /// Anything else wrong with the configuration.
    #[error("{0}")]
    Invalid(String),
}

fn parse_flag(
    flag: &'static str,
    descs: &[OptionDesc],
    input: &str,
) -> Result<OptionValues, ConfigError> {
    parse(descs, input).map_err(|source| ConfigError::Option { flag, source })
}

const LOG_OPTS: &[OptionDesc] = &[
    opt("file", OptKind::String),
    opt("fd", OptKind::Uint),
    opt("level", OptKind::Uint),
    opt("prefix", OptKind::String),
    opt("truncate", OptKind::Bool),
];

/// `--log` options.
#[derive(Debug, Default)]
pub struct LogOptions {
    /// Log file path.
    pub file: Option<PathBuf>,
    /// Inherited descriptor to log to.
    pub fd: Option<i32>,
    /// Verbosity level (0 = info).
    pub level: u32,
    /// Line prefix.
    pub prefix: Option<String>,
    /// Truncate the log file on open.
    pub truncate: bool,
}

/// Parse `--log`.
pub fn log_options(input: &str) -> Result<LogOptions, ConfigError> {
    let ovs = parse_flag("--log", LOG_OPTS, input)?;
    Ok(LogOptions {
        file: ovs.get_str("file").map(PathBuf::from),
        fd: ovs.get_uint("fd").map(|v| v as i32),
        level: ovs.get_uint("level").unwrap_or(0) as u32,
        prefix: ovs.get_str("prefix").map(str::to_string),
        truncate: ovs.get_bool("truncate", false),
    })
}

const KEY_OPTS: &[OptionDesc] = &[
    opt("file", OptKind::String),
    opt("fd", OptKind::Uint),
    opt("format", OptKind::String),
    opt("mode", OptKind::String),
    opt("remove", OptKind::Bool),
    opt("pwdfile", OptKind::String),
    opt("pwdfd", OptKind::Uint),
    opt("kdf", OptKind::String),
];

/// Parse `--key` / `--migration-key` and load the key it names.
pub fn key_options(flag: &'static str, input: &str) -> Result<SymKey, ConfigError> {
    let ovs = parse_flag(flag, KEY_OPTS, input)?;
    let nv = |source| ConfigError::Nv { flag, source };

    let format = match ovs.get_str("format") {
        Some(name) => KeyFormat::from_name(name).map_err(nv)?,
        None => KeyFormat::Hex,
    };
    let mode = match ovs.get_str("mode") {
        Some(name) => EncryptionMode::from_name(name).map_err(nv)?,
        None => EncryptionMode::Aes128Cbc,
    };
    let kdf = match ovs.get_str("kdf") {
        Some(name) => KdfId::from_name(name).map_err(nv)?,
        None => KdfId::Pbkdf2,
    };
    let remove = ovs.get_bool("remove", false);

    if let Some(file) = ovs.get_str("file") {
        keys::load_key_file(std::path::Path::new(file), format, mode, remove).map_err(nv)
    } else if let Some(fd) = ovs.get_uint("fd") {
        keys::load_key_fd(fd as i32, format, mode).map_err(nv)
    } else if let Some(pwdfile) = ovs.get_str("pwdfile") {
        keys::load_passphrase_file(std::path::Path::new(pwdfile), mode, kdf, remove).map_err(nv)
    } else if let Some(pwdfd) = ovs.get_uint("pwdfd") {
        keys::load_passphrase_fd(pwdfd as i32, mode, kdf).map_err(nv)
    } else {
        Err(ConfigError::Invalid(format!(
            "{flag}: one of file=, fd=, pwdfile=, or pwdfd= is required"
        )))
    }
}

const TPMSTATE_OPTS: &[OptionDesc] = &[
    opt("dir", OptKind::String),
    opt("mode", OptKind::Mode),
    opt("backend-uri", OptKind::String),
    opt("lock", OptKind::Bool),
    opt("backup", OptKind::Bool),
    opt("fsync", OptKind::Bool),
];

/// Parse `--tpmstate` into a store configuration. Without the flag the
/// state directory comes from `TPM_PATH`.
pub fn tpmstate_options(input: Option<&str>) -> Result<StoreConfig, ConfigError> {
    let ovs = match input {
        Some(s) => parse_flag("--tpmstate", TPMSTATE_OPTS, s)?,
        None => OptionValues::default(),
    };

    let uri = if let Some(dir) = ovs.get_str("dir") {
        format!("dir://{dir}")
    } else if let Some(uri) = ovs.get_str("backend-uri") {
        uri.to_string()
    } else if let Ok(dir) = std::env::var(TPM_PATH_ENV) {
        format!("dir://{dir}")
    } else {
        return Err(ConfigError::Invalid(
            "--tpmstate needs dir= or backend-uri= (or TPM_PATH in the environment)".into(),
        ));
    };

    let mut cfg = StoreConfig::new(uri);
    if let Some(mode) = ovs.get_mode("mode") {
        cfg.mode = mode;
        cfg.mode_is_default = false;
    }
    cfg.do_locking = ovs.get_bool("lock", cfg.do_locking);
    cfg.make_backup = ovs.get_bool("backup", false);
    cfg.do_fsync = ovs.get_bool("fsync", false);
    Ok(cfg)
}

const CHANNEL_OPTS: &[OptionDesc] = &[
    opt("type", OptKind::String),
    opt("path", OptKind::String),
    opt("port", OptKind::Uint),
    opt("bindaddr", OptKind::String),
    opt("fd", OptKind::Uint),
    opt("terminate", OptKind::Bool),
    opt("disconnect", OptKind::Bool),
];

/// Where a channel listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnSpec {
    /// UNIX-domain socket at a path.
    Unix(PathBuf),
    /// TCP socket on an address and port.
    Tcp(String, u16),
    /// Inherited listening socket.
    Fd(i32),
}

/// One channel (`--server` or `--ctrl`).
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Listener specification.
    pub spec: ConnSpec,
    /// `terminate` (ctrl): end the main loop when the peer disconnects.
    pub terminate: bool,
    /// `disconnect` (server): tolerated for compatibility; reconnects are
    /// always accepted.
    pub disconnect: bool,
}

/// Parse `--server` / `--ctrl`.
pub fn channel_options(
    flag: &'static str,
    input: &str,
) -> Result<ChannelOptions, ConfigError> {
    let ovs = parse_flag(flag, CHANNEL_OPTS, input)?;

    let ctype = ovs.get_str("type").unwrap_or("tcp");
    let spec = if let Some(fd) = ovs.get_uint("fd") {
        ConnSpec::Fd(fd as i32)
    } else {
        match ctype {
            "unixio" => {
                let path = ovs.get_str("path").ok_or_else(|| {
                    ConfigError::Invalid(format!("{flag}: type=unixio needs path="))
                })?;
                ConnSpec::Unix(PathBuf::from(path))
            }
            "tcp" => {
                let port = ovs
                    .get_uint("port")
                    .ok_or_else(|| ConfigError::Invalid(format!("{flag}: type=tcp needs port=")))?;
                let port = u16::try_from(port).map_err(|_| {
                    ConfigError::Invalid(format!("{flag}: port {port} out of range"))
                })?;
                let addr = ovs.get_str("bindaddr").unwrap_or("127.0.0.1").to_string();
                ConnSpec::Tcp(addr, port)
            }
            other => {
                return Err(ConfigError::Invalid(format!("{flag}: unknown type '{other}'")))
            }
        }
    };

    Ok(ChannelOptions {
        spec,
        terminate: ovs.get_bool("terminate", false),
        disconnect: ovs.get_bool("disconnect", false),
    })
}

/// The `--server` default when the flag is absent: `TPM_PORT`.
pub fn default_server_channel() -> Result<ChannelOptions, ConfigError> {
    let port = std::env::var(TPM_PORT_ENV).map_err(|_| {
        ConfigError::Invalid("--server is required (or set TPM_PORT)".into())
    })?;
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("TPM_PORT='{port}' is not a port")))?;
    Ok(ChannelOptions {
        spec: ConnSpec::Tcp("127.0.0.1".into(), port),
        terminate: false,
        disconnect: false,
    })
}

const LOCALITY_OPTS: &[OptionDesc] = &[
    opt("reject-locality-4", OptKind::Bool),
    opt("allow-set-locality", OptKind::Bool),
];

/// Parse `--locality`.
pub fn locality_options(input: &str) -> Result<LocalityPolicy, ConfigError> {
    let ovs = parse_flag("--locality", LOCALITY_OPTS, input)?;
    Ok(LocalityPolicy {
        allow_set_locality: ovs.get_bool("allow-set-locality", false),
        reject_locality_4: ovs.get_bool("reject-locality-4", false),
    })
}

const FLAGS_OPTS: &[OptionDesc] = &[
    opt("not-need-init", OptKind::Bool),
    opt("startup-none", OptKind::Bool),
    opt("startup-clear", OptKind::Bool),
    opt("startup-state", OptKind::Bool),
    opt("startup-deactivated", OptKind::Bool),
    opt("disable-auto-shutdown", OptKind::Bool),
];

/// `--flags` startup overrides.
#[derive(Debug, Default, Clone, Copy)]
pub struct StartupFlags {
    /// Begin serving in READY without waiting for INIT.
    pub not_need_init: bool,
    /// Startup type synthesized at INIT, when any.
    pub startup_type: Option<u16>,
    /// Do not synthesize `TPM2_Shutdown` on exit.
    pub disable_auto_shutdown: bool,
}

/// Parse `--flags`.
pub fn flags_options(input: &str) -> Result<StartupFlags, ConfigError> {
    let ovs = parse_flag("--flags", FLAGS_OPTS, input)?;
    let mut startup_type = None;
    let mut chosen = 0u8;
    for (key, st) in [
        ("startup-clear", Some(wire::TPM_ST_CLEAR)),
        ("startup-state", Some(wire::TPM_ST_STATE)),
        ("startup-deactivated", Some(wire::TPM_ST_DEACTIVATED)),
        ("startup-none", None),
    ] {
        if ovs.get_bool(key, false) {
            chosen += 1;
            startup_type = st;
        }
    }
    if chosen > 1 {
        return Err(ConfigError::Invalid("--flags: conflicting startup types".into()));
    }
    Ok(StartupFlags {
        not_need_init: ovs.get_bool("not-need-init", false),
        startup_type,
        disable_auto_shutdown: ovs.get_bool("disable-auto-shutdown", false),
    })
}

const MIGRATION_OPTS: &[OptionDesc] = &[
    opt("incoming", OptKind::Bool),
    opt("release-lock-outgoing", OptKind::Bool),
];

/// `--migration` options.
#[derive(Debug, Default, Clone, Copy)]
pub struct MigrationOptions {
    /// State arrives from a peer; defer the boot-time storage lock.
    pub incoming: bool,
    /// Drop the lock once outgoing permanent state has been handed over.
    pub release_lock_outgoing: bool,
}

/// Parse `--migration`.
pub fn migration_options(input: &str) -> Result<MigrationOptions, ConfigError> {
    let ovs = parse_flag("--migration", MIGRATION_OPTS, input)?;
    Ok(MigrationOptions {
        incoming: ovs.get_bool("incoming", false),
        release_lock_outgoing: ovs.get_bool("release-lock-outgoing", false),
    })
}

const SECCOMP_OPTS: &[OptionDesc] = &[opt("action", OptKind::String)];

/// Action the sandboxing layer applies to denied syscalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeccompAction {
    /// No filtering.
    None,
    /// Log the violation.
    Log,
    /// Kill the process.
    Kill,
}

/// Parse `--seccomp`. Validation only; the filter itself is installed by
/// the sandboxing layer outside this daemon.
pub fn seccomp_options(input: &str) -> Result<SeccompAction, ConfigError> {
    let ovs = parse_flag("--seccomp", SECCOMP_OPTS, input)?;
    match ovs.get_str("action").unwrap_or("kill") {
        "none" => Ok(SeccompAction::None),
        "log" => Ok(SeccompAction::Log),
        "kill" => Ok(SeccompAction::Kill),
        other => Err(ConfigError::Invalid(format!("--seccomp: unknown action '{other}'"))),
    }
}

const PROFILE_OPTS: &[OptionDesc] = &[
    opt("name", OptKind::String),
    opt("profile", OptKind::String),
    opt("file", OptKind::String),
    opt("fd", OptKind::Uint),
];

/// Parse `--profile` into a validated profile document.
pub fn profile_options(input: &str) -> Result<Profile, ConfigError> {
    let ovs = parse_flag("--profile", PROFILE_OPTS, input)?;
    if let Some(name) = ovs.get_str("name") {
        return Profile::builtin(name).map_err(ConfigError::Profile);
    }
    if let Some(json) = ovs.get_str("profile") {
        return Profile::from_json(json).map_err(ConfigError::Profile);
    }
    if let Some(file) = ovs.get_str("file") {
        let json = std::fs::read_to_string(file)
            .map_err(|e| ConfigError::Invalid(format!("--profile: reading {file}: {e}")))?;
        return Profile::from_json(&json).map_err(ConfigError::Profile);
    }
    if let Some(fd) = ovs.get_uint("fd") {
        let json = crate::read_fd_to_string(fd as i32)
            .map_err(|e| ConfigError::Invalid(format!("--profile: reading fd: {e}")))?;
        return Profile::from_json(&json).map_err(ConfigError::Profile);
    }
    Err(ConfigError::Invalid("--profile needs name=, profile=, file=, or fd=".into()))
}

const PID_OPTS: &[OptionDesc] = &[opt("file", OptKind::String), opt("fd", OptKind::Uint)];

/// `--pid` options.
#[derive(Debug, Clone)]
pub struct PidOptions {
    /// Pid file path.
    pub file: Option<PathBuf>,
    /// Descriptor to write the pid to.
    pub fd: Option<i32>,
}

/// Parse `--pid`.
pub fn pid_options(input: &str) -> Result<PidOptions, ConfigError> {
    let ovs = parse_flag("--pid", PID_OPTS, input)?;
    let opts = PidOptions {
        file: ovs.get_str("file").map(PathBuf::from),
        fd: ovs.get_uint("fd").map(|v| v as i32),
    };
    if opts.file.is_none() && opts.fd.is_none() {
        return Err(ConfigError::Invalid("--pid needs file= or fd=".into()));
    }
    Ok(opts)
}
