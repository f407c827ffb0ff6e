use crate::auction::{Command, Output};
use crate::encoding::{self, Value as _};
use crate::errdata;
use crate::error::{Error, Result};
use crate::raft::{NodeID, Request, Response, Status};

use itertools::Itertools as _;
use log::debug;
use std::collections::HashMap;
use std::io::Write as _;
use std::net::TcpStream;
use std::time::Duration;

/// How long to wait for a response before giving up. Must exceed the
/// server-side request timeout, so the server's more informative Timeout
/// error wins when the cluster is merely unable to commit.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection to a single gavel server.
pub struct Connection {
    reader: std::io::BufReader<TcpStream>,
    writer: std::io::BufWriter<TcpStream>,
}

impl Connection {
    /// Connects to the server at the given client address.
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;
        Ok(Self {
            reader: std::io::BufReader::new(stream.try_clone()?),
            writer: std::io::BufWriter::new(stream),
        })
    }

    /// Sends a request and blocks for the response.
    fn request(&mut self, request: Request) -> Result<Response> {
        request.encode_into(&mut self.writer)?;
        self.writer.flush()?;
        encoding::from_reader::<_, Result<Response>>(&mut self.reader)?
    }

    /// Executes an auction command, blocking until it is applied or
    /// rejected.
    pub fn execute(&mut self, command: &Command) -> Result<Output> {
        match self.request(Request::Execute(command.encode()?))? {
            Response::Execute(output) => Output::decode(&output),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Fetches the server's Raft status.
    pub fn status(&mut self) -> Result<Status> {
        match self.request(Request::Status)? {
            Response::Status(status) => Ok(status),
            response => errdata!("unexpected response {response:?}"),
        }
    }
}

/// A cluster-aware client. Commands must be executed on the leader;
/// non-leaders reject them with a leader hint, which the client follows,
/// falling back to cycling through the configured nodes when no hint is
/// available (e.g. mid-election).
///
/// Commands are deliberately not retried after transport errors: a command
/// that was accepted before the connection broke may still commit, and
/// retrying it would apply it twice.
pub struct Client {
    /// Client addresses of all cluster nodes, by node ID.
    addrs: HashMap<NodeID, String>,
    /// The current connection, typically to the leader.
    conn: Option<Connection>,
}

impl Client {
    /// Creates a new cluster client. Does not connect until the first call.
    pub fn new(addrs: HashMap<NodeID, String>) -> Self {
        Self { addrs, conn: None }
    }

    /// Executes an auction command against the cluster leader.
    pub fn execute(&mut self, command: &Command) -> Result<Output> {
        self.with_leader(|conn| conn.execute(command))
    }

    /// Fetches Raft status from the cluster leader.
    pub fn status(&mut self) -> Result<Status> {
        self.with_leader(|conn| conn.status())
    }

    /// Runs a closure against the leader's connection, following NotLeader
    /// hints and trying other nodes until one accepts or the candidate set is
    /// exhausted.
    fn with_leader<T>(&mut self, f: impl Fn(&mut Connection) -> Result<T>) -> Result<T> {
        let mut last = Error::NotLeader { leader: None };
        // Candidate addresses to try, sorted for determinism. A leader hint
        // jumps its address to the front.
        let mut candidates: Vec<String> = self.addrs.values().cloned().sorted().rev().collect();

        for _ in 0..self.addrs.len().max(1) + 1 {
            let mut conn = match self.conn.take() {
                Some(conn) => conn,
                None => {
                    let Some(addr) = candidates.pop() else { break };
                    match Connection::connect(&addr) {
                        Ok(conn) => conn,
                        Err(err) => {
                            debug!("Failed connecting to {addr}: {err}");
                            last = err;
                            continue;
                        }
                    }
                }
            };
            match f(&mut conn) {
                Err(Error::NotLeader { leader: Some(leader) }) => {
                    debug!("Not leader, following hint to {leader}");
                    if let Some(addr) = self.addrs.get(&leader) {
                        candidates.push(addr.clone());
                    }
                    last = Error::NotLeader { leader: Some(leader) };
                }
                Err(err @ Error::NotLeader { leader: None }) => last = err,
                result => {
                    self.conn = Some(conn);
                    return result;
                }
            }
        }
        Err(last)
    }
}
