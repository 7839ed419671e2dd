//! Exit node.
//!
//! Accepts middle-relay connections, learns the `path_id → writer` binding
//! from the first frame on each, reassembles upstream fragments, and serves
//! the target server with a strictly serialised `write → read_exact`
//! request/response exchange. Responses are fragmented and dispersed back
//! over the currently-live paths through the same shaping pipeline, and
//! every received data frame is acknowledged on its arrival path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::cover::ProtoRegistry;
use crate::error::{Error, Result};
use crate::observe::{LatencyRecord, RunContext};
use crate::protocol::{codec::FrameCodec, Direction, Frame, FragmentBuffer};

use super::{write_frame, PathWriters, SessionCore, SharedWriter, MAX_PADDING_FRAMES};

/// The tunnel's server-facing endpoint.
pub struct ExitNode {
    config: Config,
    registry: Arc<ProtoRegistry>,
    run: Arc<RunContext>,
    sessions: Mutex<HashMap<u32, Arc<ExitSession>>>,
}

/// The exit's connection to the target application server.
///
/// The async lock around it keeps the `write → read_exact` pair atomic;
/// concurrent fragments would otherwise interleave request and response
/// framing on the shared socket.
struct ServerConn {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

struct ExitSession {
    core: Mutex<SessionCore>,
    fragbuf: Mutex<FragmentBuffer>,
    writers: PathWriters,
    server: AsyncMutex<Option<ServerConn>>,
    registry: Arc<ProtoRegistry>,
    run: Arc<RunContext>,
    config: Config,
    path_count: usize,
    window_task: Mutex<Option<JoinHandle<()>>>,
}

impl ExitNode {
    pub fn new(config: Config, registry: Arc<ProtoRegistry>, run: Arc<RunContext>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            run,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Bind the configured listen address and serve forever.
    pub async fn run(self) -> Result<()> {
        let addr = (self.config.exit_host.clone(), self.config.exit_port);
        let listener = TcpListener::bind(addr).await?;
        info!(
            "exit listening on {}:{}",
            self.config.exit_host, self.config.exit_port
        );
        self.serve(listener).await
    }

    /// Serve middle connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let node = Arc::new(self);
        loop {
            let (stream, addr) = listener.accept().await?;
            info!("middle connected from {addr}");
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                node.handle_middle(stream).await;
                info!("middle disconnected ({addr})");
            });
        }
    }

    async fn handle_middle(&self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("nodelay failed: {e}");
        }
        let (read_half, write_half) = stream.into_split();
        let writer: SharedWriter = Arc::new(AsyncMutex::new(write_half));
        let mut framed = FramedRead::new(read_half, FrameCodec::new());

        // Paths this connection ended up bound to, for unbinding on close.
        let mut bound: Vec<(u32, u8)> = Vec::new();

        while let Some(next) = framed.next().await {
            let frame = match next {
                Ok(frame) => frame,
                Err(e) if e.is_clean_close() => break,
                Err(e) => {
                    warn!("middle link dropped: {e}");
                    break;
                }
            };

            let session_id = frame.session_id;
            let session = self.session(session_id);
            if usize::from(frame.path_id) < session.path_count
                && session.writers.bind(frame.path_id, &writer)
            {
                bound.push((session_id, frame.path_id));
            }

            match session.handle_frame(frame).await {
                Ok(()) => {}
                Err(e @ Error::UpstreamFailure(_)) => {
                    error!("session {session_id:08x} torn down: {e}");
                    self.remove_session(session_id);
                    break;
                }
                Err(e) if e.is_path_fatal() => {
                    warn!("path dropped from session {session_id:08x}: {e}");
                    break;
                }
                Err(e) => warn!("frame handling failed: {e}"),
            }
        }

        for (session_id, path_id) in bound {
            if let Some(session) = self.sessions.lock().get(&session_id).cloned() {
                session.writers.unbind(path_id, &writer);
            }
        }
    }

    /// Look up a session, creating it (and its window clock) on first use.
    fn session(&self, session_id: u32) -> Arc<ExitSession> {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(&session_id) {
            return Arc::clone(session);
        }

        // Baseline modes run a single downlink path.
        let path_count = if self.config.mode.is_baseline() {
            1
        } else {
            self.config.path_count()
        };
        let seed = self.run.seed ^ u64::from(session_id);

        let session = Arc::new(ExitSession {
            core: Mutex::new(SessionCore::new(
                &self.config,
                path_count,
                session_id,
                seed,
                self.registry.family_ids(),
            )),
            fragbuf: Mutex::new(FragmentBuffer::new()),
            writers: PathWriters::new(),
            server: AsyncMutex::new(None),
            registry: Arc::clone(&self.registry),
            run: Arc::clone(&self.run),
            config: self.config.clone(),
            path_count,
            window_task: Mutex::new(None),
        });

        let clock = Arc::clone(&session);
        *session.window_task.lock() = Some(tokio::spawn(async move {
            clock.window_loop().await;
        }));

        info!("session {session_id:08x} opened with {path_count} paths");
        sessions.insert(session_id, Arc::clone(&session));
        session
    }

    fn remove_session(&self, session_id: u32) {
        if let Some(session) = self.sessions.lock().remove(&session_id) {
            if let Some(task) = session.window_task.lock().take() {
                task.abort();
            }
        }
    }
}

impl ExitSession {
    async fn handle_frame(&self, mut frame: Frame) -> Result<()> {
        if usize::from(frame.path_id) >= self.path_count {
            debug!("frame labelled with unknown path {}", frame.path_id);
            return Ok(());
        }
        // Cover traffic and control frames are consumed at this hop.
        if frame.is_padding() || frame.is_handshake() || frame.is_ack() {
            return Ok(());
        }

        self.registry.decode_payload(&mut frame);

        if frame.is_fragment() {
            let completed = self.fragbuf.lock().add(&frame)?;
            if let Some(payload) = completed {
                self.forward(&frame, payload).await?;
            }
            self.send_ack(&frame).await;
        } else {
            let payload = std::mem::take(&mut frame.payload);
            self.forward(&frame, payload).await?;
            self.send_ack(&frame).await;
        }
        Ok(())
    }

    /// Serve one reassembled request against the target server and send
    /// the response back down the tunnel.
    async fn forward(&self, frame: &Frame, payload: Vec<u8>) -> Result<()> {
        let started = Instant::now();
        let payload_len = payload.len();

        let response = {
            let mut server = self.server.lock().await;
            if server.is_none() {
                let stream = TcpStream::connect((
                    self.config.server_host.as_str(),
                    self.config.server_port,
                ))
                .await
                .map_err(|e| Error::UpstreamFailure(format!("connect failed: {e}")))?;
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                *server = Some(ServerConn { reader, writer });
                info!(
                    "connected to target server {}:{}",
                    self.config.server_host, self.config.server_port
                );
            }
            let conn = server.as_mut().expect("server connection ensured above");

            let exchange = async {
                conn.writer.write_all(&payload).await?;
                let mut buf = vec![0u8; payload_len];
                conn.reader.read_exact(&mut buf).await?;
                std::io::Result::Ok(buf)
            }
            .await;

            match exchange {
                Ok(response) => response,
                Err(e) => {
                    *server = None;
                    let _ = self.run.record_latency(&LatencyRecord {
                        seq: frame.seq,
                        ok: false,
                        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                        payload_len,
                    });
                    return Err(Error::UpstreamFailure(e.to_string()));
                }
            }
        };

        if let Err(e) = self.run.record_latency(&LatencyRecord {
            seq: frame.seq,
            ok: true,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            payload_len,
        }) {
            warn!("latency record write failed: {e}");
        }

        self.send_downlink(frame, response).await
    }

    /// Fragment and disperse a response over the currently-live paths.
    async fn send_downlink(&self, request: &Frame, data: Vec<u8>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let fragments = {
            let mut core = self.core.lock();
            let mut fragments: Vec<(u8, Vec<u8>)> = Vec::new();
            let mut offset = 0;
            while offset < data.len() {
                let allowed = self.writers.live();
                if allowed.is_empty() {
                    debug!("no live paths for downlink, dropping response");
                    return Ok(());
                }
                let path_id = core.scheduler.choose_path_from(&allowed)?;
                let mut target = core.shaper.sample_target_len(path_id).max(1);
                if !core.shaper.params(path_id).enable_shaping {
                    target = data.len() - offset;
                }
                let take = target.min(data.len() - offset);
                let piece = data[offset..offset + take].to_vec();
                offset += take;
                core.shaper.note_real_bytes(path_id, piece.len());
                fragments.push((path_id, piece));
            }
            fragments
        };

        let frag_total = fragments.len() as u16;
        for (frag_id, (path_id, piece)) in fragments.into_iter().enumerate() {
            let raw_len = piece.len();
            let (out, pace, jitter) = {
                let mut core = self.core.lock();
                let family_id = core.family_by_path[path_id as usize];
                let variant_id = core.variant_by_path[path_id as usize];
                let mut out = Frame::fragment(
                    request.session_id,
                    request.seq,
                    Direction::Down,
                    path_id,
                    request.window_id,
                    frag_id as u16,
                    frag_total,
                    piece,
                );
                self.registry
                    .apply(&mut out, family_id, variant_id, &mut core.rng)?;
                self.registry
                    .encode_payload(&mut out, family_id, variant_id, &mut core.rng);
                let pace = core.shaper.pace_delay(path_id, raw_len);
                let jitter = core.shaper.jitter_delay(path_id);
                (out, pace, jitter)
            };

            if let Some(delay) = pace {
                tokio::time::sleep(delay).await;
            }
            if let Some(delay) = jitter {
                tokio::time::sleep(delay).await;
            }

            // The selected path may have died since the carve; the request
            // was already served and an ACK path exists elsewhere, so the
            // fragment is skipped rather than failing the session.
            let Some(writer) = self.writers.get(path_id) else {
                debug!("path {path_id} vanished, skipping fragment");
                continue;
            };
            if let Err(e) = write_frame(&writer, &out).await {
                warn!("downlink write on path {path_id} failed: {e}");
                self.writers.remove(path_id);
                continue;
            }

            let paddings = {
                let mut core = self.core.lock();
                if core.shaper.update_burst(path_id) {
                    core.shaper.make_padding_frames(&out, MAX_PADDING_FRAMES)
                } else {
                    Vec::new()
                }
            };
            for padding in paddings {
                if write_frame(&writer, &padding).await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Best-effort acknowledgment on the frame's arrival path.
    async fn send_ack(&self, frame: &Frame) {
        let Some(writer) = self.writers.get(frame.path_id) else {
            return;
        };
        let ack = Frame::ack(frame);
        if let Err(e) = write_frame(&writer, &ack).await {
            debug!("ack write on path {} failed: {e}", frame.path_id);
        }
    }

    async fn window_loop(&self) {
        loop {
            tokio::time::sleep(self.config.window_size).await;
            let records = {
                let mut core = self.core.lock();
                core.window_tick(self.config.ack_timeout)
            };
            let window_id = records.first().map_or(0, |r| r.window_id);
            self.fragbuf.lock().evict_stale(window_id);
            for record in &records {
                if let Err(e) = self.run.record_window(record) {
                    warn!("window record write failed: {e}");
                }
                info!(
                    window_id = record.window_id,
                    path_id = record.path_id,
                    proto_family = record.proto_family,
                    proto_variant = record.proto_variant,
                    rtt_ms = record.rtt_ms,
                    loss = record.loss,
                    padding_bytes = record.padding_bytes,
                    real_bytes = record.real_bytes,
                    "window closed"
                );
            }
        }
    }
}
