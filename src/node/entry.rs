//! Entry node.
//!
//! Accepts an application client, opens one TCP leg per configured middle
//! relay, and runs two loops per session: upstream (read client bytes,
//! fragment, shape, disperse across paths) and downstream (read frames from
//! every path, decode, reassemble, deliver to the client in sequence
//! order). A window-tick task re-parameterises the pipeline between chunks.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::cover::ProtoRegistry;
use crate::error::Result;
use crate::observe::RunContext;
use crate::protocol::{codec::FrameCodec, Direction, Frame, FragmentBuffer};

use super::{ReorderBuffer, SessionCore, CLIENT_CHUNK, MAX_PADDING_FRAMES};

/// The tunnel's client-facing endpoint.
pub struct EntryNode {
    config: Config,
    registry: Arc<ProtoRegistry>,
    run: Arc<RunContext>,
}

/// Ordered downstream delivery state, guarded by one async lock so path
/// readers cannot interleave their writes to the client.
struct Downstream {
    client: OwnedWriteHalf,
    reorder: ReorderBuffer,
    reassembly: FragmentBuffer,
}

struct Session {
    core: Mutex<SessionCore>,
    down: AsyncMutex<Downstream>,
    registry: Arc<ProtoRegistry>,
    run: Arc<RunContext>,
    config: Config,
}

impl EntryNode {
    pub fn new(config: Config, registry: Arc<ProtoRegistry>, run: Arc<RunContext>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            run,
        })
    }

    /// Bind the configured listen address and serve forever.
    pub async fn run(self) -> Result<()> {
        let addr = (self.config.entry_host.clone(), self.config.entry_port);
        let listener = TcpListener::bind(addr).await?;
        info!(
            "entry listening on {}:{}",
            self.config.entry_host, self.config.entry_port
        );
        self.serve(listener).await
    }

    /// Serve sessions from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let node = Arc::new(self);
        loop {
            let (client, addr) = listener.accept().await?;
            info!("client connected from {addr}");
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                match node.handle_client(client).await {
                    Ok(()) => info!("client session ended"),
                    Err(e) if e.is_clean_close() => info!("client session closed: {e}"),
                    Err(e) => warn!("client session failed: {e}"),
                }
            });
        }
    }

    async fn handle_client(&self, client: TcpStream) -> Result<()> {
        let path_count = self.config.path_count();
        let session_id: u32 = rand::thread_rng().gen_range(1..u32::MAX);
        let seed = self.run.seed ^ u64::from(session_id);

        // One TCP leg per middle relay; the upstream task is the only
        // writer on each leg.
        let mut writers: Vec<OwnedWriteHalf> = Vec::with_capacity(path_count);
        let mut readers: Vec<OwnedReadHalf> = Vec::with_capacity(path_count);
        for port in &self.config.middle_ports {
            let stream = TcpStream::connect((self.config.middle_host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            let (r, w) = stream.into_split();
            readers.push(r);
            writers.push(w);
            info!("connected to middle {}:{port}", self.config.middle_host);
        }

        client.set_nodelay(true)?;
        let (mut client_reader, client_writer) = client.into_split();

        let session = Arc::new(Session {
            core: Mutex::new(SessionCore::new(
                &self.config,
                path_count,
                session_id,
                seed,
                self.registry.family_ids(),
            )),
            down: AsyncMutex::new(Downstream {
                client: client_writer,
                reorder: ReorderBuffer::new(),
                reassembly: FragmentBuffer::new(),
            }),
            registry: Arc::clone(&self.registry),
            run: Arc::clone(&self.run),
            config: self.config.clone(),
        });

        session.send_handshakes(&mut writers).await?;

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for (path_id, reader) in readers.into_iter().enumerate() {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                session.read_path(path_id as u8, reader).await;
            }));
        }
        {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                session.window_loop().await;
            }));
        }

        // Upstream: every client chunk becomes one tunnel sequence.
        let result: Result<()> = async {
            let mut buf = vec![0u8; CLIENT_CHUNK];
            loop {
                let n = client_reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                session.send_chunk(&buf[..n], &mut writers).await?;
            }
            Ok(())
        }
        .await;

        // Closing the client cancels the downstream readers and the window
        // clock, and closes every path leg.
        for task in &tasks {
            task.abort();
        }
        for mut writer in writers {
            let _ = writer.shutdown().await;
        }
        result
    }
}

impl Session {
    /// Emit each path's cover handshake preamble, honoring the catalog's
    /// inter-frame delays.
    async fn send_handshakes(&self, writers: &mut [OwnedWriteHalf]) -> Result<()> {
        for (path_id, writer) in writers.iter_mut().enumerate() {
            let frames = {
                let mut core = self.core.lock();
                let family_id = core.family_by_path[path_id];
                let variant_id = core.variant_by_path[path_id];
                let (session_id, window_id) = (core.session_id, core.window_id);
                self.registry.handshake_frames(
                    session_id,
                    window_id,
                    family_id,
                    path_id as u8,
                    variant_id,
                    &mut core.rng,
                )?
            };
            for (frame, delay) in frames {
                writer.write_all(&frame.encode()).await?;
                tokio::time::sleep(delay).await;
            }
            debug!("handshake sent on path {path_id}");
        }
        Ok(())
    }

    /// Fragment one client chunk and disperse it across the paths.
    async fn send_chunk(&self, data: &[u8], writers: &mut [OwnedWriteHalf]) -> Result<()> {
        // Carve the chunk into path-tagged fragments under the lock; the
        // sends below sleep outside it.
        let (seq, fragments) = {
            let mut core = self.core.lock();
            let seq = core.next_seq;
            core.next_seq += 1;

            let mut fragments: Vec<(u8, Vec<u8>)> = Vec::new();
            let mut offset = 0;
            while offset < data.len() {
                let path_id = core.scheduler.choose_path();
                let target = core.shaper.sample_target_len(path_id).max(1);
                let take = target.min(data.len() - offset);
                let piece = data[offset..offset + take].to_vec();
                offset += take;
                core.shaper.note_real_bytes(path_id, piece.len());
                fragments.push((path_id, piece));
            }
            (seq, fragments)
        };

        let frag_total = fragments.len() as u16;
        for (frag_id, (path_id, piece)) in fragments.into_iter().enumerate() {
            let raw_len = piece.len();
            let (frame, pace, jitter) = {
                let mut core = self.core.lock();
                let family_id = core.family_by_path[path_id as usize];
                let variant_id = core.variant_by_path[path_id as usize];
                let mut frame = Frame::fragment(
                    core.session_id,
                    seq,
                    Direction::Up,
                    path_id,
                    core.window_id,
                    frag_id as u16,
                    frag_total,
                    piece,
                );
                self.registry
                    .apply(&mut frame, family_id, variant_id, &mut core.rng)?;
                self.registry
                    .encode_payload(&mut frame, family_id, variant_id, &mut core.rng);
                core.scheduler.mark_sent(path_id, seq);
                let pace = core.shaper.pace_delay(path_id, raw_len);
                let jitter = core.shaper.jitter_delay(path_id);
                (frame, pace, jitter)
            };

            if let Some(delay) = pace {
                tokio::time::sleep(delay).await;
            }
            if let Some(delay) = jitter {
                tokio::time::sleep(delay).await;
            }

            let writer = &mut writers[path_id as usize];
            if let Err(e) = writer.write_all(&frame.encode()).await {
                warn!("write on path {path_id} failed, skipping fragment: {e}");
                continue;
            }

            // A full burst of real frames earns one burst of padding on the
            // same socket.
            let paddings = {
                let mut core = self.core.lock();
                if core.shaper.update_burst(path_id) {
                    core.shaper.make_padding_frames(&frame, MAX_PADDING_FRAMES)
                } else {
                    Vec::new()
                }
            };
            for padding in paddings {
                if let Err(e) = writer.write_all(&padding.encode()).await {
                    warn!("padding write on path {path_id} failed: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Downstream reader for one path.
    async fn read_path(&self, path_id: u8, reader: OwnedReadHalf) {
        let mut framed = FramedRead::new(reader, FrameCodec::new());
        while let Some(next) = framed.next().await {
            let mut frame = match next {
                Ok(frame) => frame,
                Err(e) if e.is_clean_close() => {
                    debug!("path {path_id} closed");
                    return;
                }
                Err(e) => {
                    warn!("path {path_id} dropped: {e}");
                    return;
                }
            };

            if frame.is_ack() {
                if let Some(seq) = frame.acked_seq() {
                    self.core.lock().scheduler.mark_ack(frame.path_id, seq);
                }
                continue;
            }
            if frame.is_padding() || frame.is_handshake() {
                continue;
            }
            if frame.direction != Direction::Down {
                continue;
            }

            self.registry.decode_payload(&mut frame);

            let mut down = self.down.lock().await;
            let completed = if frame.is_fragment() {
                match down.reassembly.add(&frame) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("path {path_id} dropped: {e}");
                        return;
                    }
                }
            } else {
                Some(std::mem::take(&mut frame.payload))
            };

            if let Some(payload) = completed {
                let ready = down.reorder.push(frame.seq, payload);
                for chunk in ready {
                    if let Err(e) = down.client.write_all(&chunk).await {
                        debug!("client write failed: {e}");
                        return;
                    }
                }
            }
        }
    }

    /// The session's window clock.
    async fn window_loop(&self) {
        loop {
            tokio::time::sleep(self.config.window_size).await;
            let records = {
                let mut core = self.core.lock();
                core.window_tick(self.config.ack_timeout)
            };
            let window_id = records.first().map_or(0, |r| r.window_id);
            {
                let mut down = self.down.lock().await;
                down.reassembly.evict_stale(window_id);
            }
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
