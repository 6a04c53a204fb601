//! The bridge core: one single-task event loop moving records between the
//! TCP clients and the message bus.
//!
//! Each tick runs a fixed sequence: service the bus (fanning inbound
//! messages out to the pool inside the same tick), wait briefly for
//! readiness on the listening socket or any pooled socket, drain whatever
//! the clients buffered, and only then install at most one newly accepted
//! connection. Draining before inserting means an eviction can never race
//! ahead of data already buffered on the connection it dooms.

use crate::bus::{BusClient, BusMessage};
use crate::codec::{self, ReadOutcome};
use crate::config::BridgeConfig;
use crate::pool::{self, ConnectionPool, Insert};
use crate::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

pub struct BridgeServer<B: BusClient> {
    config: BridgeConfig,
    listener: TcpListener,
    pool: ConnectionPool,
    bus: B,
    running: Arc<AtomicBool>,
    dump_requested: Arc<AtomicBool>,
}

impl<B: BusClient> BridgeServer<B> {
    /// Bind the listening socket and establish the bus subscription.
    ///
    /// Both failures here are startup misconfiguration and abort the
    /// process with a non-zero exit.
    pub async fn bind(config: BridgeConfig, mut bus: B) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;

        bus.subscribe(&config.topic_filter)?;

        Ok(Self {
            pool: ConnectionPool::new(config.max_connections),
            config,
            listener,
            bus,
            running: Arc::new(AtomicBool::new(true)),
            dump_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Clearing this flag makes the loop exit at the top of its next tick.
    pub fn run_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Setting this flag makes the next tick log the pool snapshot.
    pub fn dump_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.dump_requested)
    }

    /// Run the event loop until the run flag is cleared.
    ///
    /// On return every owned resource - the listening socket, every pooled
    /// socket, the bus handle - is released exactly once by drop.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "bridge listening on {}, pool capacity {}",
            self.listener.local_addr()?,
            self.pool.capacity()
        );

        while self.running.load(Ordering::SeqCst) {
            if self.dump_requested.swap(false, Ordering::SeqCst) {
                self.dump_pool();
            }

            // 1. service the bus; inbound messages fan out within the tick
            match self.bus.service(self.config.service_timeout()).await {
                Ok(messages) => {
                    for message in messages {
                        self.fan_out(&message).await;
                    }
                }
                Err(e) => warn!("bus service error, reconnect scheduled: {}", e),
            }

            // 2-3. bounded readiness wait
            let accepted = self.wait_ready().await?;

            // 4. drain ready clients before the new connection is placed
            self.drain_clients();

            // 5. install at most one accepted connection per tick
            if let Some((stream, peer)) = accepted {
                self.install_client(stream, peer).await;
            }
        }

        info!(
            "shutdown requested, closing {} client connection(s)",
            self.pool.len()
        );
        Ok(())
    }

    /// Wait until the listener or any pooled socket is ready, bounded by
    /// the poll timeout so the loop always comes back for the bus tick.
    /// A pending connection is returned but not yet installed.
    async fn wait_ready(&self) -> Result<Option<(TcpStream, SocketAddr)>> {
        let poll = tokio::time::sleep(self.config.poll_timeout());
        tokio::pin!(poll);

        tokio::select! {
            biased;
            res = self.listener.accept() => {
                match res {
                    Ok(pair) => Ok(Some(pair)),
                    Err(e) => {
                        // not a per-connection condition: bail out with a
                        // non-zero exit rather than spin on a broken listener
                        error!("accept failed: {}", e);
                        Err(e.into())
                    }
                }
            }
            _ = self.pool.wait_readable() => Ok(None),
            _ = &mut poll => Ok(None),
        }
    }

    /// Read every line the clients have buffered, publishing well-formed
    /// records to the bus and evicting connections that fail. Lines still
    /// missing their terminator stay buffered on their connection until a
    /// later tick completes them.
    fn drain_clients(&mut self) {
        let max_line_len = self.config.max_line_len;
        for slot in 0..self.pool.capacity() {
            loop {
                let (outcome, peer) = match self.pool.connection_mut(slot) {
                    Some(conn) => (conn.read_line(max_line_len), conn.peer()),
                    None => break,
                };
                match outcome {
                    ReadOutcome::NotReady => break,
                    ReadOutcome::Line(line) => {
                        if line.is_empty() {
                            continue;
                        }
                        match codec::decode_line(&line) {
                            Ok(record) => {
                                debug!(
                                    "client {} -> bus: topic {} payload {}",
                                    peer, record.topic, record.payload
                                );
                                if let Err(e) =
                                    self.bus.publish(&record.topic, record.payload.as_bytes())
                                {
                                    warn!("publish from {} failed: {}", peer, e);
                                }
                            }
                            Err(e) => {
                                warn!("discarding malformed line from {}: {}", peer, e);
                            }
                        }
                    }
                    ReadOutcome::TooLong => {
                        warn!(
                            "client {} exceeded the {} byte line limit, closing slot {}",
                            peer, self.config.max_line_len, slot
                        );
                        self.pool.remove(slot);
                        break;
                    }
                    ReadOutcome::Disconnected => {
                        info!("client {} disconnected, clearing slot {}", peer, slot);
                        self.pool.remove(slot);
                        break;
                    }
                }
            }
        }
    }

    /// Greet and store a newly accepted connection, evicting if the pool
    /// is full.
    async fn install_client(&mut self, stream: TcpStream, peer: SocketAddr) {
        match codec::encode_line("hello", "hello", self.config.max_line_len) {
            Ok(greeting) => {
                if let Err(e) = pool::write_full(&stream, &greeting).await {
                    warn!("greeting write to {} failed: {}", peer, e);
                }
            }
            Err(e) => warn!("greeting line rejected: {}", e),
        }

        match self.pool.try_insert(stream, peer) {
            Insert::Stored(slot) => {
                info!("client {} connected, slot {}", peer, slot);
            }
            Insert::Evicted { slot, evicted } => {
                info!(
                    "pool full: evicted {} from slot {} for new client {}",
                    evicted, slot, peer
                );
            }
        }
    }

    /// Operator diagnostics, triggered by signal. Never mutates the pool.
    fn dump_pool(&self) {
        let snapshot = self.pool.snapshot();
        info!(
            "connection pool: {} of {} slots in use",
            snapshot.len(),
            self.pool.capacity()
        );
        info!("slot\tfd\tage\tpeer");
        for entry in snapshot {
            info!("{}\t{}\t{}\t{}", entry.slot, entry.fd, entry.age, entry.peer);
        }
    }

    /// Encode one inbound bus message and broadcast it to the pool.
    async fn fan_out(&mut self, message: &BusMessage) {
        match codec::encode_line(&message.topic, &message.payload, self.config.max_line_len) {
            Ok(line) => {
                let recipients = self.pool.broadcast(&line).await;
                debug!(
                    "bus -> {} client(s): topic {} payload {}",
                    recipients, message.topic, message.payload
                );
            }
            Err(e) => {
                warn!("dropping bus message on {}: {}", message.topic, e);
            }
        }
    }
}
