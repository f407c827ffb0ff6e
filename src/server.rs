use crate::encoding::{self, Value as _};
use crate::error::{Error, Result};
use crate::raft;
use crate::raft::{Envelope, Message, Node, NodeID, Request, RequestID, Response};

use crossbeam::channel::{Receiver, Sender, TrySendError};
use log::{debug, error, info};
use std::collections::HashMap;
use std::io::Write as _;
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

/// The number of outbound messages to buffer per peer. When the buffer fills
/// up (e.g. while the peer is unreachable), messages are dropped; the Raft
/// protocol recovers via heartbeats.
const PEER_SEND_BUFFER: usize = 1000;

/// The delay before reconnecting to an unreachable peer.
const PEER_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long a client request may wait for its command to be accepted and
/// applied before the server gives up and reports a timeout. This bounds e.g.
/// commands accepted by a leader that can't reach a quorum.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A gavel server. Runs a single Raft node, and serves two TCP listeners: one
/// for peer RPCs and one for client command submission.
///
/// All Raft processing happens on a single event loop thread, which steps
/// inbound messages, timer expiries, and client requests into the node one at
/// a time. Peer connections are handled by dedicated threads that only move
/// envelopes between sockets and channels; a connection's send side
/// reconnects forever, and delivery is best-effort.
pub struct Server {
    node: Node,
    node_rx: Receiver<Envelope>,
    timer_rx: Receiver<raft::TimerFire>,
    peers: HashMap<NodeID, String>,
}

impl Server {
    /// Creates a new server for the given node. The peer map gives the Raft
    /// RPC address of every other cluster member, keyed by node ID.
    pub fn new(
        id: NodeID,
        peers: HashMap<NodeID, String>,
        log: raft::Log,
        state: Box<dyn raft::State>,
        opts: raft::Options,
    ) -> Result<Self> {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let (timer_tx, timer_rx) = crossbeam::channel::unbounded();
        let scheduler = raft::Scheduler::new(timer_tx);
        let node = Node::new(
            id,
            peers.keys().cloned().collect(),
            log,
            state,
            node_tx,
            scheduler,
            opts,
        )?;
        Ok(Self { node, node_rx, timer_rx, peers })
    }

    /// Serves Raft peer RPCs and client requests indefinitely.
    pub fn serve(self, raft_addr: &str, client_addr: &str) -> Result<()> {
        let raft_listener = TcpListener::bind(raft_addr)?;
        let client_listener = TcpListener::bind(client_addr)?;
        info!(
            "Listening on {} (peer RPC) and {} (client)",
            raft_listener.local_addr()?,
            client_listener.local_addr()?
        );

        std::thread::scope(move |s| {
            // Inbound envelopes from peers.
            let (step_tx, step_rx) = crossbeam::channel::unbounded();
            s.spawn(move || Self::peer_accept(raft_listener, step_tx));

            // Outbound envelopes to peers, one sender thread per peer.
            let mut peer_txs = HashMap::new();
            for (id, addr) in self.peers {
                let (tx, rx) = crossbeam::channel::bounded(PEER_SEND_BUFFER);
                peer_txs.insert(id, tx);
                s.spawn(move || Self::peer_send(addr, rx));
            }

            // Client requests from session threads.
            let (request_tx, request_rx) = crossbeam::channel::unbounded();
            s.spawn(move || Self::client_accept(client_listener, request_tx));

            // The event loop is fatal on error: a node with corrupt state or
            // a dead channel can't continue, and supervision must restart it.
            if let Err(error) = Self::event_loop(
                self.node,
                self.node_rx,
                self.timer_rx,
                step_rx,
                request_rx,
                peer_txs,
            ) {
                error!("Raft event loop failed: {error}");
                std::process::exit(1);
            }
            Ok(())
        })
    }

    /// Runs the Raft event loop: steps inbound peer messages, timer fires,
    /// and client requests into the node, and routes its outbound messages.
    fn event_loop(
        mut node: Node,
        node_rx: Receiver<Envelope>,
        timer_rx: Receiver<raft::TimerFire>,
        step_rx: Receiver<Envelope>,
        request_rx: Receiver<(Request, Sender<Result<Response>>)>,
        peer_txs: HashMap<NodeID, Sender<Envelope>>,
    ) -> Result<()> {
        // Pending client requests, by request ID.
        let mut requests = HashMap::<RequestID, Sender<Result<Response>>>::new();
        loop {
            crossbeam::select! {
                // An envelope arrived from a peer. Drop malformed traffic
                // (unknown sender, wrong recipient) before it reaches the
                // node.
                recv(step_rx) -> msg => {
                    let msg = msg?;
                    if !peer_txs.contains_key(&msg.from) || &msg.to != node.id() {
                        error!("Dropping invalid envelope from {} to {}", msg.from, msg.to);
                        continue;
                    }
                    node = node.step(msg)?;
                }

                // A timer expired.
                recv(timer_rx) -> fire => node = node.on_timer(fire?)?,

                // A client session submitted a request. Assign it an ID and
                // step it into the node; the response is routed back below.
                recv(request_rx) -> request => {
                    let (request, response_tx) = request?;
                    let id = uuid::Uuid::new_v4().as_bytes().to_vec();
                    requests.insert(id.clone(), response_tx);
                    let msg = Envelope {
                        from: node.id().clone(),
                        to: node.id().clone(),
                        term: node.term(),
                        message: Message::ClientRequest { id, request },
                    };
                    node = node.step(msg)?;
                }

                // The node emitted an outbound message: a response to a local
                // client, or an envelope for a peer.
                recv(node_rx) -> msg => {
                    let msg = msg?;
                    if let Message::ClientResponse { id, response } = msg.message {
                        if let Some(response_tx) = requests.remove(&id) {
                            // The session may have timed out and gone away.
                            let _ = response_tx.try_send(response);
                        }
                        continue;
                    }
                    match peer_txs.get(&msg.to) {
                        Some(tx) => match tx.try_send(msg) {
                            Ok(()) => {}
                            Err(TrySendError::Full(msg)) => {
                                debug!("Send buffer for {} full, discarding message", msg.to);
                            }
                            Err(err @ TrySendError::Disconnected(_)) => return Err(err.into()),
                        },
                        None => error!("Dropping outbound message to unknown peer {}", msg.to),
                    }
                }
            }
        }
    }

    /// Accepts inbound peer connections, spawning a receiver thread for each.
    fn peer_accept(listener: TcpListener, step_tx: Sender<Envelope>) {
        std::thread::scope(|s| {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(err) => {
                        error!("Peer accept failed: {err}");
                        continue;
                    }
                };
                let step_tx = step_tx.clone();
                s.spawn(move || {
                    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
                    debug!("Peer {peer} connected");
                    match Self::peer_receive(stream, step_tx) {
                        Ok(()) => debug!("Peer {peer} disconnected"),
                        Err(err) => error!("Peer {peer} error: {err}"),
                    }
                });
            }
        });
    }

    /// Receives envelopes from a peer connection until it closes.
    fn peer_receive(stream: TcpStream, step_tx: Sender<Envelope>) -> Result<()> {
        let mut reader = std::io::BufReader::new(stream);
        while let Some(envelope) = Envelope::maybe_decode_from(&mut reader)? {
            step_tx.send(envelope)?;
        }
        Ok(())
    }

    /// Sends outbound envelopes to a peer, reconnecting on failure. Messages
    /// submitted while the peer is unreachable remain buffered in the channel
    /// until it fills up, after which the event loop discards them.
    fn peer_send(addr: String, rx: Receiver<Envelope>) {
        loop {
            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    debug!("Connected to peer {addr}");
                    match Self::peer_send_session(stream, &rx) {
                        // The channel closed, we're shutting down.
                        Ok(()) => return,
                        Err(err) => debug!("Failed sending to peer {addr}: {err}"),
                    }
                }
                Err(err) => debug!("Failed connecting to peer {addr}: {err}"),
            }
            std::thread::sleep(PEER_RECONNECT_DELAY);
        }
    }

    /// Sends envelopes over a single peer connection.
    fn peer_send_session(stream: TcpStream, rx: &Receiver<Envelope>) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut writer = std::io::BufWriter::new(stream);
        while let Ok(envelope) = rx.recv() {
            envelope.encode_into(&mut writer)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Accepts client connections, spawning a session thread for each.
    fn client_accept(
        listener: TcpListener,
        request_tx: Sender<(Request, Sender<Result<Response>>)>,
    ) {
        std::thread::scope(|s| {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(err) => {
                        error!("Client accept failed: {err}");
                        continue;
                    }
                };
                let request_tx = request_tx.clone();
                s.spawn(move || {
                    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
                    debug!("Client {peer} connected");
                    match Self::client_session(stream, request_tx) {
                        Ok(()) => debug!("Client {peer} disconnected"),
                        Err(err) => error!("Client {peer} error: {err}"),
                    }
                });
            }
        });
    }

    /// Serves a client session: a sequence of blocking request/response
    /// exchanges over a single connection. The caller blocks until its
    /// command is applied or rejected; if neither happens within the request
    /// timeout, it receives Error::Timeout and may retry.
    fn client_session(
        stream: TcpStream,
        request_tx: Sender<(Request, Sender<Result<Response>>)>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut reader = std::io::BufReader::new(stream.try_clone()?);
        let mut writer = std::io::BufWriter::new(stream);
        while let Some(request) = Request::maybe_decode_from(&mut reader)? {
            let (response_tx, response_rx) = crossbeam::channel::bounded(1);
            request_tx.send((request, response_tx))?;
            let response: Result<Response> = match response_rx.recv_timeout(REQUEST_TIMEOUT) {
                Ok(response) => response,
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => Err(Error::Timeout),
                Err(err) => return Err(err.into()),
            };
            encoding::to_writer(&mut writer, &response)?;
            writer.flush()?;
        }
        Ok(())
    }
}
