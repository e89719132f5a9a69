//! Network front end
//!
//! Two blocking accept loops: the main port carries replication
//! mutations, trysync requests and admin commands; the heartbeat port
//! (main port plus the fixed delta) answers PING. Connections get one
//! handler thread each. `stop` flips a shared flag; the accept loops
//! poll it between non-blocking accepts and handler threads notice it
//! through their read timeouts.

use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use fluxhub_core::admin;
use fluxhub_core::hub::{Hub, InboundListener};
use fluxhub_core::protocol;
use fluxhub_core::{Error, Result, HEARTBEAT_PORT_DELTA};

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const CONN_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// RESP listener over blocking TCP, started on promotion.
pub struct RespListener {
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RespListener {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            conns: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Default for RespListener {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundListener for RespListener {
    fn start(&self, hub: Arc<Hub>) -> Result<()> {
        self.stop.store(false, Ordering::SeqCst);
        let cfg = hub.config();
        let main_addr = format!("{}:{}", cfg.local_ip, cfg.local_port);
        let hb_addr = format!(
            "{}:{}",
            cfg.local_ip,
            cfg.local_port + HEARTBEAT_PORT_DELTA
        );

        let main = TcpListener::bind(&main_addr)?;
        let heartbeat = TcpListener::bind(&hb_addr)?;
        main.set_nonblocking(true)?;
        heartbeat.set_nonblocking(true)?;
        tracing::info!(%main_addr, %hb_addr, "inbound listener started");

        let mut threads = self.threads.lock();
        threads.push(spawn_accept_loop(
            "fluxhub-accept",
            main,
            Arc::clone(&self.stop),
            Arc::clone(&self.conns),
            {
                let hub = Arc::clone(&hub);
                move |stream, stop| handle_connection(stream, &hub, &stop)
            },
        )?);
        threads.push(spawn_accept_loop(
            "fluxhub-accept-hb",
            heartbeat,
            Arc::clone(&self.stop),
            Arc::clone(&self.conns),
            |stream, stop| handle_heartbeat(stream, &stop),
        )?);
        Ok(())
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }
        // Handler threads must be gone before stop returns: an in-flight
        // mutation holds a binlog writer handle, and demotion needs the
        // last one dropped before it can reset the log.
        for conn in self.conns.lock().drain(..) {
            let _ = conn.join();
        }
        tracing::info!("inbound listener stopped");
    }
}

fn spawn_accept_loop<F>(
    name: &str,
    listener: TcpListener,
    stop: Arc<AtomicBool>,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
    handler: F,
) -> Result<JoinHandle<()>>
where
    F: Fn(TcpStream, Arc<AtomicBool>) + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    tracing::debug!(%addr, "connection accepted");
                    let handler = Arc::clone(&handler);
                    let stop = Arc::clone(&stop);
                    // Handlers exit on EOF or when the stop flag flips;
                    // the listener joins them on stop.
                    match std::thread::Builder::new()
                        .name("fluxhub-conn".to_string())
                        .spawn(move || handler(stream, stop))
                    {
                        Ok(handle) => conns.lock().push(handle),
                        Err(e) => tracing::warn!(error = %e, "failed to spawn handler"),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        })?;
    Ok(thread)
}

/// Serve one main-port connection until EOF, error or stop.
fn handle_connection(stream: TcpStream, hub: &Arc<Hub>, stop: &AtomicBool) {
    if let Err(e) = serve_commands(stream, hub, stop) {
        tracing::debug!(error = %e, "connection closed");
    }
}

fn serve_commands(stream: TcpStream, hub: &Arc<Hub>, stop: &AtomicBool) -> Result<()> {
    stream.set_read_timeout(Some(CONN_READ_TIMEOUT))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    // Peer id learned from a trysync on this connection, for fd
    // accounting.
    let mut session_peer: Option<i32> = None;

    let result = loop {
        if stop.load(Ordering::SeqCst) {
            break Ok(());
        }
        let args = match protocol::read_command(&mut reader) {
            Ok(Some(args)) => args,
            Ok(None) => break Ok(()),
            Err(Error::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => break Err(e),
        };
        match dispatch(&args, hub, &mut session_peer) {
            Ok(reply) => writer.write_all(&reply)?,
            Err(e) => writer.write_all(&protocol::encode_error(&e.to_string()))?,
        }
    };

    if let Some(peer_id) = session_peer {
        hub.peers()
            .with_peer(peer_id, |p| p.rcv_fd_count = p.rcv_fd_count.saturating_sub(1));
    }
    result
}

/// Route one command: mutation, trysync or admin.
fn dispatch(args: &[Vec<u8>], hub: &Arc<Hub>, session_peer: &mut Option<i32>) -> Result<Vec<u8>> {
    if let Some((record, sequence, offset)) = protocol::parse_mutation(args)? {
        hub.apply_mutation(record, sequence, offset)?;
        return Ok(protocol::encode_status("ok"));
    }
    if args[0].eq_ignore_ascii_case(protocol::TRYSYNC_COMMAND.as_bytes()) {
        return handle_trysync(args, hub, session_peer);
    }
    if admin::is_admin_command(&args[0]) {
        let cmd = admin::parse_admin(args)?;
        return Ok(hub.handle_admin(cmd).render());
    }
    Err(Error::protocol(format!(
        "unknown command {:?}",
        String::from_utf8_lossy(&args[0])
    )))
}

/// A peer asks us to resume forwarding at its requested position. The
/// request identifies the peer by its registered address; the sequence
/// is clamped to the retained log.
fn handle_trysync(
    args: &[Vec<u8>],
    hub: &Arc<Hub>,
    session_peer: &mut Option<i32>,
) -> Result<Vec<u8>> {
    let req = protocol::parse_trysync(args)?;
    let Some(peer_id) = hub.peers().find_by_addr(&req.ip, req.port) else {
        return Ok(protocol::encode_error(&format!(
            "unknown peer {}:{}",
            req.ip, req.port
        )));
    };
    let first = hub.manager().first_segment();
    let (sequence, offset) = if req.sequence < first {
        (first, 0)
    } else {
        (req.sequence, req.offset)
    };
    hub.peers().with_peer(peer_id, |p| {
        p.send_number = sequence;
        p.send_offset = offset;
        if session_peer.is_none() {
            p.rcv_fd_count += 1;
        }
    });
    *session_peer = Some(peer_id);
    tracing::info!(peer = peer_id, sequence, offset, "trysync accepted");
    Ok(protocol::encode_status("ok"))
}

/// Serve one heartbeat-port connection: PONG to every PING.
fn handle_heartbeat(stream: TcpStream, stop: &AtomicBool) {
    let _ = serve_heartbeat(stream, stop);
}

fn serve_heartbeat(stream: TcpStream, stop: &AtomicBool) -> Result<()> {
    stream.set_read_timeout(Some(CONN_READ_TIMEOUT))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        match protocol::read_command(&mut reader) {
            Ok(Some(args)) if args[0].eq_ignore_ascii_case(b"PING") => {
                writer.write_all(&protocol::encode_status("PONG"))?;
            }
            Ok(Some(_)) => {
                writer.write_all(&protocol::encode_error("expected PING"))?;
            }
            Ok(None) => return Ok(()),
            Err(Error::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}
