//! Serving loops over one shared TPM unit.
//!
//! The data loop carries raw TPM commands through the request pipeline; the
//! control loop speaks the framed `PTM_*` protocol. Both serialize on the
//! unit mutex. Cancel and run-state queries stay off the mutex, and a state
//! transfer holds it for the whole fragment sequence so commands cannot
//! interleave.

use std::sync::Arc;

use nvstate::{NvError, NvStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use tpmdrv::wire::{self, rc, TpmVersion};
use tpmdrv::{Canceller, LocalityPolicy, RequestPipeline, TpmDriver, TpmEngine};

use crate::proto::{self, CtrlCommand};
use crate::state::{RunState, RunStateCell};

// Data-channel frames: header-declared size, bounded well above the largest
// negotiable command buffer plus the transport prefix.
const MAX_DATA_FRAME: usize = 64 * 1024 + 9;
const MAX_HASH_CHUNK: usize = 64 * 1024;

/// Serving policy fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct ServeConfig {
    /// End the main loop when the control peer disconnects.
    pub end_on_hup: bool,
    /// Startup type to synthesize after each successful INIT
    /// (`wire::TPM_ST_*`); `None` leaves Startup to the client.
    pub startup_type: Option<u16>,
    /// Locality policy for the request pipeline.
    pub locality_policy: LocalityPolicy,
    /// Profile document applied at INIT (TPM 2 only).
    pub profile_json: Option<String>,
    /// Take the storage lock during INIT.
    pub lock_storage_on_init: bool,
    /// Drop the storage lock once an outgoing permanent-state transfer
    /// completes, so the migration peer can take it.
    pub release_lock_outgoing: bool,
}

/// Driver plus pipeline, guarded by the unit mutex.
pub struct TpmUnit<E: TpmEngine> {
    /// The engine adapter.
    pub driver: TpmDriver<E>,
    /// The per-connection command pipeline.
    pub pipeline: RequestPipeline,
}

struct Inner<E: TpmEngine> {
    unit: Arc<Mutex<TpmUnit<E>>>,
    run_state: RunStateCell,
    canceller: Canceller,
    store: Arc<NvStore>,
    version: TpmVersion,
    cfg: ServeConfig,
    stop_tx: watch::Sender<bool>,
}

/// Handle shared by the serving tasks.
pub struct Service<E: TpmEngine> {
    inner: Arc<Inner<E>>,
}

impl<E: TpmEngine> Clone for Service<E> {
    fn clone(&self) -> Self {
        Service { inner: self.inner.clone() }
    }
}

// A GET_STATEBLOB in progress: the unit stays locked until the last
// fragment leaves, keeping the transfer atomic against command processing.
struct GetTransfer<E: TpmEngine> {
    _guard: OwnedMutexGuard<TpmUnit<E>>,
    name: nvstate::BlobName,
    blob: Vec<u8>,
    encrypted: bool,
    offset: usize,
}

struct SetTransfer<E: TpmEngine> {
    guard: OwnedMutexGuard<TpmUnit<E>>,
    blobtype: u32,
    caller_encrypted: bool,
    buf: Vec<u8>,
}

impl<E: TpmEngine> Service<E> {
    /// Wrap a driver for serving.
    pub fn new(driver: TpmDriver<E>, cfg: ServeConfig) -> Self {
        let store = driver.store().clone();
        let canceller = driver.canceller();
        let version = driver.version();
        let pipeline = RequestPipeline::new(version, cfg.locality_policy);
        let (stop_tx, _) = watch::channel(false);
        Service {
            inner: Arc::new(Inner {
                unit: Arc::new(Mutex::new(TpmUnit { driver, pipeline })),
                run_state: RunStateCell::new(),
                canceller,
                store,
                version,
                cfg,
                stop_tx,
            }),
        }
    }

    /// Current run state.
    pub fn run_state(&self) -> RunState {
        self.inner.run_state.get()
    }

    /// Receiver that flips to `true` when the main loop should end.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.inner.stop_tx.subscribe()
    }

    /// Enter the terminating state and wake the main loop.
    pub fn request_shutdown(&self) {
        self.inner.run_state.set(RunState::Terminating);
        let _ = self.inner.stop_tx.send(true);
    }

    /// Initialize (or re-initialize) the TPM and move to READY. Used by the
    /// INIT command and by the `not-need-init` startup override.
    pub async fn init_tpm(&self, delete_volatile: bool) -> Result<(), tpmdrv::DrvError> {
        self.init_tpm_with(delete_volatile, self.inner.cfg.lock_storage_on_init).await
    }

    /// Like [`Service::init_tpm`], with the storage-lock decision made by
    /// the caller. Incoming migration defers the boot-time lock until the
    /// source has handed the state over.
    pub async fn init_tpm_with(
        &self,
        delete_volatile: bool,
        lock_storage: bool,
    ) -> Result<(), tpmdrv::DrvError> {
        let mut unit = self.inner.unit.lock().await;
        if unit.driver.is_running() {
            unit.driver.stop();
        }
        unit.driver.start(
            self.inner.cfg.profile_json.as_deref(),
            lock_storage,
            delete_volatile,
        )?;

        if let Some(startup_type) = self.inner.cfg.startup_type {
            match wire::startup_cmd(self.inner.version, startup_type) {
                Some(cmd) => match unit.driver.process(&cmd, 0) {
                    Ok(resp) => {
                        let code = wire::response_code(&resp).unwrap_or(rc::FAIL);
                        if code != rc::SUCCESS {
                            warn!(code = format_args!("{code:#x}"), "startup command refused");
                        }
                    }
                    Err(e) => warn!(error = %e, "startup command failed"),
                },
                None => warn!("startup type not supported by this TPM version"),
            }
        }

        self.inner.run_state.set(RunState::Ready);
        info!("tpm initialized");
        Ok(())
    }

    /// Stop the TPM and mark the service terminating. Called when the main
    /// loop winds down.
    pub async fn finish(&self) {
        let mut unit = self.inner.unit.lock().await;
        unit.driver.stop();
        self.inner.run_state.set(RunState::Terminating);
    }

    /// Serve raw TPM commands from one data connection until it closes.
    pub async fn serve_data<S>(&self, mut stream: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let Some(frame) = read_data_frame(&mut stream).await? else {
                break;
            };
            let response = match self.inner.run_state.get() {
                RunState::Ready => {
                    let mut guard = self.inner.unit.lock().await;
                    let unit = &mut *guard;
                    self.inner.run_state.set(RunState::Processing);
                    let resp = unit.pipeline.handle(&mut unit.driver, &frame);
                    if self.inner.run_state.get() == RunState::Processing {
                        self.inner.run_state.set(RunState::Ready);
                    }
                    resp
                }
                state => {
                    debug!(?state, "data command outside READY");
                    wire::fatal_error_response(self.inner.version)
                }
            };
            stream.write_all(&response).await?;
        }

        // The client may never come back; flush a missing shutdown now.
        let mut unit = self.inner.unit.lock().await;
        unit.driver.connection_closed();
        Ok(())
    }

    /// Serve framed control commands from one connection until it closes.
    pub async fn serve_ctrl<S>(&self, mut stream: S) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut get_transfer: Option<GetTransfer<E>> = None;
        let mut set_transfer: Option<SetTransfer<E>> = None;

        loop {
            let mut code_buf = [0u8; 4];
            match stream.read_exact(&mut code_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let code = u32::from_be_bytes(code_buf);
            let Some(cmd) = CtrlCommand::from_code(code) else {
                warn!(code, "unknown control command");
                write_result(&mut stream, rc::BAD_PARAMETER, &[]).await?;
                break;
            };
            debug!(?cmd, "control command");

            match cmd {
                CtrlCommand::GetCapability => {
                    write_result(&mut stream, rc::SUCCESS, &proto::caps::ALL.to_be_bytes())
                        .await?;
                }
                CtrlCommand::Init => {
                    let flags = read_u32(&mut stream).await?;
                    let delete_volatile = flags & proto::INIT_FLAG_DELETE_VOLATILE != 0;
                    let result = match self.init_tpm(delete_volatile).await {
                        Ok(()) => rc::SUCCESS,
                        Err(e) => {
                            warn!(error = %e, "init failed");
                            proto::drv_result(&e)
                        }
                    };
                    write_result(&mut stream, result, &[]).await?;
                }
                CtrlCommand::Shutdown => {
                    write_result(&mut stream, rc::SUCCESS, &[]).await?;
                    self.request_shutdown();
                    break;
                }
                CtrlCommand::GetTpmEstablished => {
                    let unit = self.inner.unit.lock().await;
                    if unit.driver.is_running() {
                        let bit = u8::from(unit.driver.tpm_established());
                        write_result(&mut stream, rc::SUCCESS, &[bit]).await?;
                    } else {
                        write_result(&mut stream, rc::FAIL, &[]).await?;
                    }
                }
                CtrlCommand::SetLocality => {
                    let locality = read_u8(&mut stream).await?;
                    let mut unit = self.inner.unit.lock().await;
                    let result = match unit.pipeline.set_locality(locality) {
                        Ok(()) => rc::SUCCESS,
                        Err(_) => rc::BAD_LOCALITY,
                    };
                    write_result(&mut stream, result, &[]).await?;
                }
                CtrlCommand::HashStart => {
                    let result = self.with_running_driver(|d| d.hash_start()).await;
                    write_result(&mut stream, result, &[]).await?;
                }
                CtrlCommand::HashData => {
                    let len = read_u32(&mut stream).await? as usize;
                    if len > MAX_HASH_CHUNK {
                        write_result(&mut stream, rc::BAD_PARAMETER, &[]).await?;
                        break;
                    }
                    let mut data = vec![0u8; len];
                    stream.read_exact(&mut data).await?;
                    let result = self.with_running_driver(|d| d.hash_data(&data)).await;
                    write_result(&mut stream, result, &[]).await?;
                }
                CtrlCommand::HashEnd => {
                    let result = self.with_running_driver(|d| d.hash_end()).await;
                    write_result(&mut stream, result, &[]).await?;
                }
                CtrlCommand::CancelTpmCmd => {
                    let forwarded = self.inner.canceller.cancel();
                    debug!(forwarded, "cancel requested");
                    write_result(&mut stream, rc::SUCCESS, &[]).await?;
                }
                CtrlCommand::StoreVolatile => {
                    let result = self.with_running_driver(|d| d.store_volatile()).await;
                    write_result(&mut stream, result, &[]).await?;
                }
                CtrlCommand::ResetTpmEstablished => {
                    let locality = read_u8(&mut stream).await?;
                    let result = if locality == 3 || locality == 4 {
                        self.with_running_driver(|d| d.reset_established()).await
                    } else {
                        rc::BAD_LOCALITY
                    };
                    write_result(&mut stream, result, &[]).await?;
                }
                CtrlCommand::GetStateBlob => {
                    self.handle_get_stateblob(&mut stream, &mut get_transfer).await?;
                }
                CtrlCommand::SetStateBlob => {
                    self.handle_set_stateblob(&mut stream, &mut set_transfer).await?;
                }
                CtrlCommand::Stop => {
                    let mut unit = self.inner.unit.lock().await;
                    unit.driver.stop();
                    self.inner.run_state.set(RunState::Stopped);
                    write_result(&mut stream, rc::SUCCESS, &[]).await?;
                }
                CtrlCommand::GetConfig => {
                    let mut flags = 0u32;
                    if self.inner.store.keys().has_state_key() {
                        flags |= proto::CONFIG_FLAG_FILE_KEY;
                    }
                    if self.inner.store.keys().has_migration_key() {
                        flags |= proto::CONFIG_FLAG_MIGRATION_KEY;
                    }
                    write_result(&mut stream, rc::SUCCESS, &flags.to_be_bytes()).await?;
                }
                CtrlCommand::SetBufferSize => {
                    let wanted = read_u32(&mut stream).await?;
                    match self.inner.run_state.get() {
                        RunState::Ready | RunState::Processing => {
                            write_result(&mut stream, rc::FAIL, &[]).await?;
                        }
                        _ => {
                            let mut unit = self.inner.unit.lock().await;
                            let (size, min, max) = unit.driver.set_buffer_size(wanted);
                            let mut body = Vec::with_capacity(12);
                            body.extend_from_slice(&size.to_be_bytes());
                            body.extend_from_slice(&min.to_be_bytes());
                            body.extend_from_slice(&max.to_be_bytes());
                            write_result(&mut stream, rc::SUCCESS, &body).await?;
                        }
                    }
                }
                CtrlCommand::LockStorage => {
                    let retries = read_u32(&mut stream).await?;
                    let result = match self.inner.store.lock_storage(retries) {
                        Ok(()) => rc::SUCCESS,
                        Err(e) => proto::nv_result(&e),
                    };
                    write_result(&mut stream, result, &[]).await?;
                }
            }
        }

        if self.inner.cfg.end_on_hup {
            info!("control peer disconnected, ending main loop");
            self.request_shutdown();
        }
        Ok(())
    }

    async fn with_running_driver<F>(&self, op: F) -> u32
    where
        F: FnOnce(&mut TpmDriver<E>) -> Result<(), tpmdrv::DrvError>,
    {
        let mut unit = self.inner.unit.lock().await;
        if !unit.driver.is_running() {
            return rc::FAIL;
        }
        match op(&mut unit.driver) {
            Ok(()) => rc::SUCCESS,
            Err(e) => proto::drv_result(&e),
        }
    }

    async fn handle_get_stateblob<S>(
        &self,
        stream: &mut S,
        transfer: &mut Option<GetTransfer<E>>,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let flags = read_u32(stream).await?;
        let blobtype = read_u32(stream).await?;
        let offset = read_u32(stream).await? as usize;

        if offset == 0 {
            *transfer = None;
            let Some(name) = proto::blob_name(blobtype) else {
                return write_result(stream, rc::BAD_PARAMETER, &[]).await;
            };
            let guard = self.inner.unit.clone().lock_owned().await;
            let reencrypt = flags & proto::STATE_FLAG_DECRYPTED == 0;
            match self.inner.store.export_blob(name, reencrypt) {
                Ok((blob, encrypted)) => {
                    *transfer =
                        Some(GetTransfer { _guard: guard, name, blob, encrypted, offset: 0 });
                }
                Err(NvError::Retry) => {
                    // Never-written blob: an empty, final fragment.
                    return write_get_fragment(stream, proto::STATE_FLAG_LAST, 0, &[]).await;
                }
                Err(e) => {
                    warn!(error = %e, "state blob export failed");
                    return write_result(stream, proto::nv_result(&e), &[]).await;
                }
            }
        }

        let Some(t) = transfer.as_mut() else {
            return write_result(stream, rc::BAD_PARAMETER, &[]).await;
        };
        if offset != t.offset {
            *transfer = None;
            return write_result(stream, rc::BAD_PARAMETER, &[]).await;
        }

        let n = (t.blob.len() - t.offset).min(proto::STATE_BLOB_CHUNK);
        let chunk = &t.blob[t.offset..t.offset + n];
        let last = t.offset + n == t.blob.len();
        let mut out_flags = 0u32;
        if t.encrypted {
            out_flags |= proto::STATE_FLAG_ENCRYPTED;
        }
        if last {
            out_flags |= proto::STATE_FLAG_LAST;
        }
        let total = t.blob.len() as u32;
        write_get_fragment(stream, out_flags, total, chunk).await?;
        t.offset += n;
        if last {
            let name = t.name;
            *transfer = None;
            if self.inner.cfg.release_lock_outgoing && name == nvstate::BlobName::PermAll {
                info!("outgoing transfer complete, releasing the storage lock");
                self.inner.store.release_lock();
            }
        }
        Ok(())
    }

    async fn handle_set_stateblob<S>(
        &self,
        stream: &mut S,
        transfer: &mut Option<SetTransfer<E>>,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let blobtype = read_u32(stream).await?;
        let flags = read_u32(stream).await?;
        let length = read_u32(stream).await? as usize;
        if length > proto::STATE_BLOB_CHUNK {
            // Oversized fragment; the stream position is unrecoverable.
            write_result(stream, rc::BAD_PARAMETER, &[]).await?;
            return Err(std::io::Error::other("oversized state blob fragment"));
        }
        let mut data = vec![0u8; length];
        stream.read_exact(&mut data).await?;

        if transfer.is_none() {
            if proto::blob_name(blobtype).is_none() {
                return write_result(stream, rc::BAD_PARAMETER, &[]).await;
            }
            let guard = self.inner.unit.clone().lock_owned().await;
            *transfer = Some(SetTransfer {
                guard,
                blobtype,
                caller_encrypted: flags & proto::STATE_FLAG_ENCRYPTED != 0,
                buf: Vec::new(),
            });
        }

        let t = transfer.as_mut().expect("transfer set above");
        if t.blobtype != blobtype {
            *transfer = None;
            return write_result(stream, rc::BAD_PARAMETER, &[]).await;
        }
        t.buf.extend_from_slice(&data);

        let last = flags & proto::STATE_FLAG_LAST != 0 || length < proto::STATE_BLOB_CHUNK;
        if !last {
            return write_result(stream, rc::SUCCESS, &[]).await;
        }

        let mut t = transfer.take().expect("transfer set above");
        let name = proto::blob_name(t.blobtype).expect("validated at transfer start");
        let result = if t.buf.is_empty() {
            match t.guard.driver.set_state(name, &[]) {
                Ok(()) => rc::SUCCESS,
                Err(e) => proto::drv_result(&e),
            }
        } else {
            match self.inner.store.import_blob(&t.buf, t.caller_encrypted) {
                Ok(plain) => match t.guard.driver.set_state(name, &plain) {
                    Ok(()) => rc::SUCCESS,
                    Err(e) => proto::drv_result(&e),
                },
                Err(e) => {
                    warn!(error = %e, "state blob import failed");
                    proto::nv_result(&e)
                }
            }
        };
        write_result(stream, result, &[]).await
    }
}

async fn read_u8<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    Ok(buf[0])
}

async fn read_u32<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

async fn write_result<S: AsyncWrite + Unpin>(
    stream: &mut S,
    result: u32,
    body: &[u8],
) -> std::io::Result<()> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&result.to_be_bytes());
    out.extend_from_slice(body);
    stream.write_all(&out).await
}

async fn write_get_fragment<S: AsyncWrite + Unpin>(
    stream: &mut S,
    flags: u32,
    total: u32,
    chunk: &[u8],
) -> std::io::Result<()> {
    let mut out = Vec::with_capacity(16 + chunk.len());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
    out.extend_from_slice(chunk);
    stream.write_all(&out).await
}

/// Read one data-channel frame. The frame length comes from the TPM header
/// or, for prefixed commands, from the transport prefix; a short first read
/// is completed before dispatch.
async fn read_data_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; MAX_DATA_FRAME];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    let mut have = n;
    while let Some(expected) = frame_len(&buf[..have]) {
        let expected = expected.clamp(have, buf.len());
        if have >= expected {
            break;
        }
        let m = stream.read(&mut buf[have..expected]).await?;
        if m == 0 {
            break;
        }
        have += m;
    }
    buf.truncate(have);
    Ok(Some(buf))
}

fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() >= 9 {
        let tag = u16::from_be_bytes([buf[0], buf[1]]);
        if tag != wire::TPM2_ST_NO_SESSIONS
            && tag != wire::TPM2_ST_SESSIONS
            && tag != wire::TPM_TAG_RQU_COMMAND
        {
            let opcode = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            if opcode == 8 {
                let inner = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
                return Some(9 + inner);
            }
            return None;
        }
    }
    if buf.len() >= 6 {
        return Some(u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize);
    }
    None
}
