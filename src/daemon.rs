use crate::allowlist::Allowlists;
use crate::cli::DaemonArgs;
use crate::greylister::Greylister;
use crate::immunity::{ConnectionSignals, FingerprintLookup, GeoLookup};
use crate::milter::*;
use crate::session::{Envelope, StageVerdict};
use crate::wire::{BufReadExt as _, ReadExt as _, write_packet};
use nix::libc::c_int;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, pause};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::error::Error;
use std::io::{BufRead, BufReader, BufWriter, Cursor, ErrorKind, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
#[cfg(feature = "systemd")]
use std::os::fd::FromRawFd as _;
use std::process::exit;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

static FLAG_SHUTDOWN: AtomicBool = AtomicBool::new(false);
static CHILDREN_CNT: AtomicU16 = AtomicU16::new(0);

// 65535 body chunk + headroom, see postfix milter8.c
const MAX_PACKET_LEN: u32 = 69632;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Everything a milter session needs. Cheap to clone for worker threads.
#[derive(Clone)]
pub struct Config {
    pub greylister: Greylister,
    pub allowlists: Arc<Allowlists>,
    pub fingerprint: Option<Arc<dyn FingerprintLookup>>,
    pub geo: Option<Arc<dyn GeoLookup>>,
}

impl Config {
    pub fn new(greylister: Greylister) -> Self {
        Self {
            greylister,
            allowlists: Arc::new(Allowlists::default()),
            fingerprint: None,
            geo: None,
        }
    }

    fn signals(
        &self,
        remote_ip: IpAddr,
        sender: &str,
        macros: &HashMap<String, String>,
    ) -> ConnectionSignals {
        let present = |name: &str| macros.get(name).is_some_and(|v| !v.is_empty());
        ConnectionSignals {
            relay_client: present("{auth_authen}"),
            allowlisted_host: self.allowlists.hosts.contains_host(remote_ip),
            allowlisted_sender: self.allowlists.senders.contains_address(sender),
            tls: present("{tls_version}"),
            fingerprint: self.fingerprint.as_ref().and_then(|l| l.fingerprint(remote_ip)),
            country: self.geo.as_ref().and_then(|l| l.country(remote_ip)),
        }
    }
}

fn reply(writer: &mut impl Write, verdict: &StageVerdict, pass: u8) -> std::io::Result<()> {
    match verdict {
        StageVerdict::Continue => write_packet(writer, pass, b"")?,
        StageVerdict::Defer(msg) => {
            let mut text = tempfail_reply(msg).into_bytes();
            text.push(0);
            write_packet(writer, SMFIR_REPLYCODE, &text)?;
        }
    }
    writer.flush()
}

/// Postfix sends `IPv6:` prefixed addresses for family `6` on some setups.
fn parse_client_addr(family: char, addr: &str) -> Option<IpAddr> {
    match family {
        '4' | '6' => addr.strip_prefix("IPv6:").unwrap_or(addr).parse().ok(),
        _ => None,
    }
}

/// Serve one MTA connection until it quits.
pub fn process_client(
    config: &Config,
    mut stream_reader: impl BufRead,
    mut stream_writer: impl Write,
) -> Result<(), Box<dyn Error>> {
    let mut data_read_buffer: Vec<u8> = Vec::with_capacity(4096);
    let mut string_buffer = Vec::<u8>::new();

    let mut connect_macros: HashMap<String, String> = HashMap::new();
    let mut macros: HashMap<String, String> = HashMap::new();
    let mut remote_ip: Option<IpAddr> = None;
    let mut envelope: Option<Envelope> = None;

    loop {
        let len = match stream_reader.read_u32_be() {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        if len > MAX_PACKET_LEN {
            return Err(format!("received packet too long ({len} > {MAX_PACKET_LEN})").into());
        }
        stream_reader.read_bytes(len as usize, &mut data_read_buffer)?;
        let mut data_reader = Cursor::new(data_read_buffer);
        let cmd = data_reader.read_char()?;
        let id = macros.get("i").cloned().unwrap_or_else(|| "-".to_string());
        match cmd {
            SMFIC_OPTNEG => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&SMFIF_VERSION.to_be_bytes());
                payload.extend_from_slice(&0u32.to_be_bytes()); // no modifications
                payload.extend_from_slice(&PROTOCOL.to_be_bytes());
                write_packet(&mut stream_writer, b'O', &payload)?;
                stream_writer.flush()?;
            }
            SMFIC_MACRO => {
                let for_cmd = data_reader.read_char()?;
                let macro_map = match for_cmd {
                    SMFIC_CONNECT | SMFIC_HELO => &mut connect_macros,
                    _ => &mut macros,
                };
                loop {
                    let name = data_reader.read_zstring(&mut string_buffer)?;
                    if name.is_empty() {
                        break;
                    }
                    let value = data_reader.read_zstring(&mut string_buffer)?;
                    macro_map.insert(name, value);
                }
            }
            SMFIC_CONNECT => {
                let hostname = data_reader.read_zstring(&mut string_buffer)?;
                let family = data_reader.read_char()?;
                remote_ip = match family {
                    '4' | '6' => {
                        let _port = data_reader.read_u16_be()?;
                        let addr = data_reader.read_zstring(&mut string_buffer)?;
                        parse_client_addr(family, &addr)
                    }
                    _ => None,
                };
                debug!(%hostname, remote_ip = ?remote_ip, "connect");
                // reply disabled with SMFIP_NR_CONN
            }
            SMFIC_HELO => {
                // reply disabled with SMFIP_NR_HELO
            }
            SMFIC_MAIL => {
                let sender = data_reader.read_zstring_anglestripped(&mut string_buffer)?;
                let verdict = match remote_ip {
                    Some(ip) => {
                        let mut all = connect_macros.clone();
                        all.extend(macros.iter().map(|(k, v)| (k.clone(), v.clone())));
                        let signals = config.signals(ip, &sender, &all);
                        let env = envelope.insert(Envelope::new(ip, &sender, signals));
                        env.on_mail(&config.greylister)
                    }
                    None => {
                        debug!(%id, "no client address, greylisting skipped");
                        StageVerdict::Continue
                    }
                };
                if let StageVerdict::Defer(msg) = &verdict {
                    info!(%id, %sender, "MAIL deferred: {msg}");
                }
                reply(&mut stream_writer, &verdict, SMFIR_CONTINUE)?;
            }
            SMFIC_RCPT => {
                let recipient = data_reader.read_zstring_anglestripped(&mut string_buffer)?;
                let verdict = match envelope.as_mut() {
                    Some(env) => {
                        let allowlisted = config.allowlists.recipients.contains_address(&recipient);
                        env.on_rcpt(&config.greylister, &recipient, allowlisted)
                    }
                    None => StageVerdict::Continue,
                };
                if let StageVerdict::Defer(msg) = &verdict {
                    info!(%id, %recipient, "RCPT deferred: {msg}");
                }
                reply(&mut stream_writer, &verdict, SMFIR_CONTINUE)?;
            }
            SMFIC_BODYEOB => {
                let verdict = match &envelope {
                    Some(env) => env.on_end_of_message(&config.greylister),
                    None => StageVerdict::Continue,
                };
                if let StageVerdict::Defer(msg) = &verdict {
                    info!(%id, "message deferred: {msg}");
                }
                reply(&mut stream_writer, &verdict, SMFIR_ACCEPT)?;
                envelope = None;
                macros.clear();
            }
            SMFIC_ABORT => {
                envelope = None;
                macros.clear();
                // no reply to SMFIC_ABORT
            }
            SMFIC_QUIT_NC => {
                envelope = None;
                macros.clear();
                connect_macros.clear();
                remote_ip = None;
            }
            SMFIC_QUIT => break,
            _ => {
                warn!(%id, "ignoring unexpected milter command {cmd:?}");
            }
        }
        data_read_buffer = data_reader.into_inner();
    }
    Ok(())
}

extern "C" fn handlerfunc(_signum: c_int) {
    FLAG_SHUTDOWN.store(true, Ordering::Relaxed);
}

extern "C" fn handlerfunc_child(_signum: c_int) {
    while let Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) =
        waitpid(Some(Pid::from_raw(-1)), Some(WaitPidFlag::WNOHANG))
    {
        let _ = CHILDREN_CNT.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            n.checked_sub(1)
        });
    }
}

fn install_signal_handler() -> Result<(), Box<dyn Error>> {
    let handler = SigHandler::Handler(handlerfunc);
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGINT, &action)?;
    }
    let handler = SigHandler::Handler(handlerfunc_child);
    let action = SigAction::new(handler, SaFlags::SA_NOCLDSTOP, SigSet::empty());
    unsafe {
        sigaction(Signal::SIGCHLD, &action)?;
    }
    Ok(())
}

/// The store is rewritten on every decision, so it is pruned while the
/// daemon runs and not only at startup.
struct MaintenanceSchedule {
    interval: Duration,
    last: Option<Instant>,
}

impl MaintenanceSchedule {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

fn run_maintenance(config: &Config) {
    if let Err(e) = config.greylister.maintain() {
        error!("greylist maintenance failed: {e}");
    }
}

/// Returns a thread slot on drop, also when the worker panics.
struct WorkerSlot(Arc<(Mutex<u16>, Condvar)>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.0;
        let mut count = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        cvar.notify_one();
    }
}

fn bind(address: &str) -> Result<Socket, Box<dyn Error>> {
    let address: SocketAddr = address.parse()?;
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(128)?;
    Ok(socket)
}

fn serve_stream(config: &Config, stream: &TcpStream) -> Result<(), Box<dyn Error>> {
    process_client(config, BufReader::new(stream), BufWriter::new(stream))
}

pub fn daemon(config: &Config, args: &DaemonArgs) -> Result<(), Box<dyn Error>> {
    if args.fork_max > 0 && args.threads_max > 0 {
        return Err("--fork and --threads are mutually exclusive".into());
    }

    #[cfg(feature = "systemd")]
    let listen_socket = match systemd::daemon::listen_fds(false)?.iter().next() {
        Some(fd) => unsafe { Socket::from_raw_fd(fd) },
        None => bind(&args.address)?,
    };
    #[cfg(not(feature = "systemd"))]
    let listen_socket = bind(&args.address)?;

    let mut maintenance = MaintenanceSchedule::new(MAINTENANCE_INTERVAL);
    if maintenance.due(Instant::now()) {
        run_maintenance(config);
    }

    let thread_state: Option<Arc<(Mutex<u16>, Condvar)>> = if args.threads_max > 0 {
        Some(Arc::new((Mutex::new(0), Condvar::new())))
    } else {
        None
    };

    install_signal_handler()?;
    info!(address = %args.address, "greymilter listening");
    loop {
        if args.fork_max > 0 {
            while CHILDREN_CNT.load(Ordering::Relaxed) >= args.fork_max {
                pause()
            }
        } else if let Some(ref state) = thread_state {
            let (lock, cvar) = state.as_ref();
            let mut count = lock.lock().unwrap_or_else(PoisonError::into_inner);
            while *count >= args.threads_max {
                count = cvar.wait(count).unwrap_or_else(PoisonError::into_inner);
            }
        }
        match listen_socket.accept() {
            Ok((socket, _addr)) => {
                let stream: TcpStream = socket.into();
                if args.fork_max > 0 {
                    match unsafe { fork() } {
                        Ok(ForkResult::Parent { .. }) => {
                            CHILDREN_CNT.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(ForkResult::Child) => {
                            drop(listen_socket);
                            match serve_stream(config, &stream) {
                                Ok(_) => exit(0),
                                Err(e) => {
                                    error!("{e}");
                                    exit(1)
                                }
                            }
                        }
                        Err(e) => error!("fork: {e}"),
                    }
                } else if let Some(state) = &thread_state {
                    let state = Arc::clone(state);
                    *state.0.lock().unwrap_or_else(PoisonError::into_inner) += 1;
                    let config = config.clone();
                    thread::spawn(move || {
                        let _slot = WorkerSlot(state);
                        if let Err(e) = serve_stream(&config, &stream) {
                            error!("thread error: {e}");
                        }
                    });
                } else if let Err(e) = serve_stream(config, &stream) {
                    error!("{e}");
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => (),
            Err(e) => error!("accept: {e}"),
        }
        if maintenance.due(Instant::now()) {
            run_maintenance(config);
        }
        if FLAG_SHUTDOWN.load(Ordering::Relaxed) {
            info!("shutting down");
            break;
        }
    }

    if let Some(ref state) = thread_state {
        let (lock, cvar) = state.as_ref();
        let mut count = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            info!("waiting for {} threads to complete", *count);
            count = cvar
                .wait_timeout(count, Duration::from_secs(1))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maintenance_schedule() {
        let start = Instant::now();
        let mut schedule = MaintenanceSchedule::new(Duration::from_secs(3600));
        assert!(schedule.due(start));
        assert!(!schedule.due(start + Duration::from_secs(10)));
        assert!(!schedule.due(start + Duration::from_secs(3599)));
        assert!(schedule.due(start + Duration::from_secs(3600)));
        assert!(!schedule.due(start + Duration::from_secs(3601)));
    }
}
