//! The auction state machine: a relational store of users, auctions, and
//! bids, replicated through Raft. All nodes apply the same committed commands
//! in the same order, so every mutation and validation rule in here must be a
//! deterministic function of the command and the preceding state.
//!
//! The store itself is in-memory and not durable; on restart it is rebuilt by
//! replaying the Raft log from the start.

use crate::encoding::Value;
use crate::errinput;
use crate::error::Result;
use crate::raft;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A money amount, in integer minor units (e.g. cents). Floats are avoided
/// since replicas must agree bit-for-bit.
pub type Amount = u64;

/// A unix timestamp in milliseconds. Timestamps are supplied by clients and
/// replicated inside commands, so applying them is deterministic; nodes never
/// read their own clocks here.
pub type Timestamp = i64;

/// An auction ID, assigned sequentially by the store.
pub type AuctionID = u64;

/// Auction store configuration. This is handed through opaquely from the
/// server configuration, and must be identical on all nodes since it affects
/// command validation.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The minimum accepted password length for new users.
    pub min_password_length: usize,
    /// The minimum amount by which a bid must exceed the current highest.
    pub min_bid_increment: Amount,
}

impl Default for Config {
    fn default() -> Self {
        Self { min_password_length: 4, min_bid_increment: 1 }
    }
}

/// A command against the auction store. New kinds can be added without
/// changing the Raft core, which treats commands as opaque bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Registers a new user.
    NewUser { username: String, password: String },
    /// Opens a new auction for an object, sold by an existing user.
    NewAuction {
        user: String,
        start_date: Timestamp,
        obj_name: String,
        obj_desc: String,
        start_price: Amount,
    },
    /// Places a bid on an open auction.
    NewBid { user: String, auction_id: AuctionID, value: Amount },
    /// Closes an auction, awarding it to the highest bidder if any.
    CloseAuction { auction_id: AuctionID, closing_date: Timestamp },
}

impl Value for Command {}

/// The result of an applied command, returned to the submitting client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Output {
    UserCreated { username: String },
    AuctionCreated { id: AuctionID },
    BidPlaced { auction_id: AuctionID, value: Amount },
    AuctionClosed { id: AuctionID, winner: Option<String>, winning_bid: Option<Amount> },
}

impl Value for Output {}

/// A registered user.
#[derive(Clone, Debug)]
struct User {
    #[allow(dead_code)]
    password: String,
}

/// A bid on an auction. Bids are stored in placement order, and each must
/// exceed the previous one, so the last bid is the highest.
#[derive(Clone, Debug)]
struct Bid {
    bidder: String,
    value: Amount,
}

/// An auction.
#[derive(Clone, Debug)]
struct Auction {
    seller: String,
    start_date: Timestamp,
    #[allow(dead_code)]
    obj_name: String,
    #[allow(dead_code)]
    obj_desc: String,
    start_price: Amount,
    bids: Vec<Bid>,
    /// The closing date, set when the auction is closed.
    closed: Option<Timestamp>,
}

/// The auction store, implementing the Raft state machine.
pub struct State {
    config: Config,
    users: BTreeMap<String, User>,
    auctions: BTreeMap<AuctionID, Auction>,
    next_auction_id: AuctionID,
    applied_index: raft::Index,
}

impl State {
    /// Creates an empty auction store.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            users: BTreeMap::new(),
            auctions: BTreeMap::new(),
            next_auction_id: 1,
            applied_index: 0,
        }
    }

    /// Executes a command against the store. All validation errors are
    /// deterministic: they depend only on the command and the store state.
    fn execute(&mut self, command: Command) -> Result<Output> {
        match command {
            Command::NewUser { username, password } => {
                if username.is_empty() {
                    return errinput!("username can't be empty");
                }
                if password.len() < self.config.min_password_length {
                    return errinput!(
                        "password must be at least {} characters",
                        self.config.min_password_length
                    );
                }
                if self.users.contains_key(&username) {
                    return errinput!("user {username} already exists");
                }
                self.users.insert(username.clone(), User { password });
                Ok(Output::UserCreated { username })
            }

            Command::NewAuction { user, start_date, obj_name, obj_desc, start_price } => {
                if !self.users.contains_key(&user) {
                    return errinput!("unknown user {user}");
                }
                if obj_name.is_empty() {
                    return errinput!("object name can't be empty");
                }
                if start_price == 0 {
                    return errinput!("start price must be positive");
                }
                let id = self.next_auction_id;
                self.next_auction_id += 1;
                self.auctions.insert(
                    id,
                    Auction {
                        seller: user,
                        start_date,
                        obj_name,
                        obj_desc,
                        start_price,
                        bids: Vec::new(),
                        closed: None,
                    },
                );
                Ok(Output::AuctionCreated { id })
            }

            Command::NewBid { user, auction_id, value } => {
                if !self.users.contains_key(&user) {
                    return errinput!("unknown user {user}");
                }
                let Some(auction) = self.auctions.get_mut(&auction_id) else {
                    return errinput!("unknown auction {auction_id}");
                };
                if auction.closed.is_some() {
                    return errinput!("auction {auction_id} is closed");
                }
                if auction.seller == user {
                    return errinput!("can't bid on own auction");
                }
                let minimum = match auction.bids.last() {
                    Some(bid) => bid.value + self.config.min_bid_increment,
                    None => auction.start_price,
                };
                if value < minimum {
                    return errinput!("bid must be at least {minimum}");
                }
                auction.bids.push(Bid { bidder: user, value });
                Ok(Output::BidPlaced { auction_id, value })
            }

            Command::CloseAuction { auction_id, closing_date } => {
                let Some(auction) = self.auctions.get_mut(&auction_id) else {
                    return errinput!("unknown auction {auction_id}");
                };
                if auction.closed.is_some() {
                    return errinput!("auction {auction_id} is already closed");
                }
                if closing_date < auction.start_date {
                    return errinput!("closing date before start date");
                }
                auction.closed = Some(closing_date);
                let winner = auction.bids.last();
                Ok(Output::AuctionClosed {
                    id: auction_id,
                    winner: winner.map(|b| b.bidder.clone()),
                    winning_bid: winner.map(|b| b.value),
                })
            }
        }
    }
}

impl raft::State for State {
    fn get_applied_index(&self) -> raft::Index {
        self.applied_index
    }

    fn apply(&mut self, entry: raft::Entry) -> Result<Vec<u8>> {
        assert_eq!(entry.index, self.applied_index + 1, "entries must be applied in order");
        // The entry counts as applied even when the command is rejected; the
        // rejection is part of the replicated history.
        self.applied_index = entry.index;
        // A command that doesn't decode means the log itself is corrupt. The
        // decode error is not deterministic, so the node halts on it.
        let command = Command::decode(&entry.command)?;
        let output = self.execute(command)?;
        output.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::raft::State as _;

    use test_case::test_case;

    fn setup() -> State {
        let mut state = State::new(Config::default());
        for user in ["alice", "bob"] {
            state
                .execute(Command::NewUser {
                    username: user.to_string(),
                    password: "hunter2".to_string(),
                })
                .expect("user failed");
        }
        state
    }

    /// Opens an auction sold by alice at start price 100, returning its ID.
    fn open_auction(state: &mut State) -> AuctionID {
        match state.execute(Command::NewAuction {
            user: "alice".to_string(),
            start_date: 1_700_000_000_000,
            obj_name: "teapot".to_string(),
            obj_desc: "slightly chipped".to_string(),
            start_price: 100,
        }) {
            Ok(Output::AuctionCreated { id }) => id,
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn new_user() {
        let mut state = State::new(Config::default());
        let output = state
            .execute(Command::NewUser {
                username: "alice".to_string(),
                password: "hunter2".to_string(),
            })
            .expect("execute failed");
        assert_eq!(output, Output::UserCreated { username: "alice".to_string() });
    }

    #[test_case("", "hunter2", "username can't be empty")]
    #[test_case("carol", "abc", "password must be at least 4 characters")]
    #[test_case("alice", "hunter2", "user alice already exists")]
    fn new_user_rejections(username: &str, password: &str, error: &str) {
        let mut state = setup();
        let result = state.execute(Command::NewUser {
            username: username.to_string(),
            password: password.to_string(),
        });
        assert_eq!(result, Err(Error::InvalidInput(error.to_string())));
    }

    #[test]
    fn auction_ids_are_sequential() {
        let mut state = setup();
        assert_eq!(open_auction(&mut state), 1);
        assert_eq!(open_auction(&mut state), 2);
        assert_eq!(open_auction(&mut state), 3);
    }

    #[test]
    fn bidding() {
        let mut state = setup();
        let id = open_auction(&mut state);
        let bid = |state: &mut State, user: &str, value| {
            state.execute(Command::NewBid {
                user: user.to_string(),
                auction_id: id,
                value,
            })
        };

        // The first bid must reach the start price.
        assert_eq!(
            bid(&mut state, "bob", 99),
            Err(Error::InvalidInput("bid must be at least 100".to_string()))
        );
        assert_eq!(bid(&mut state, "bob", 100), Ok(Output::BidPlaced { auction_id: id, value: 100 }));

        // Subsequent bids must exceed the highest by the increment.
        assert_eq!(
            bid(&mut state, "bob", 100),
            Err(Error::InvalidInput("bid must be at least 101".to_string()))
        );

        // Sellers can't bid on their own auctions, and bidders must exist.
        assert_eq!(
            bid(&mut state, "alice", 200),
            Err(Error::InvalidInput("can't bid on own auction".to_string()))
        );
        assert_eq!(
            bid(&mut state, "mallory", 200),
            Err(Error::InvalidInput("unknown user mallory".to_string()))
        );
    }

    #[test]
    fn close_awards_highest_bidder() {
        let mut state = setup();
        let id = open_auction(&mut state);
        state
            .execute(Command::NewBid { user: "bob".to_string(), auction_id: id, value: 150 })
            .expect("bid failed");

        let output = state
            .execute(Command::CloseAuction { auction_id: id, closing_date: 1_700_000_001_000 })
            .expect("close failed");
        assert_eq!(
            output,
            Output::AuctionClosed {
                id,
                winner: Some("bob".to_string()),
                winning_bid: Some(150)
            }
        );

        // Closed auctions accept no bids and can't be closed again.
        assert_eq!(
            state.execute(Command::NewBid {
                user: "bob".to_string(),
                auction_id: id,
                value: 200
            }),
            Err(Error::InvalidInput(format!("auction {id} is closed")))
        );
        assert_eq!(
            state.execute(Command::CloseAuction {
                auction_id: id,
                closing_date: 1_700_000_002_000
            }),
            Err(Error::InvalidInput(format!("auction {id} is already closed")))
        );
    }

    #[test]
    fn close_without_bids() {
        let mut state = setup();
        let id = open_auction(&mut state);
        let output = state
            .execute(Command::CloseAuction { auction_id: id, closing_date: 1_700_000_001_000 })
            .expect("close failed");
        assert_eq!(output, Output::AuctionClosed { id, winner: None, winning_bid: None });
    }

    /// Applying entries advances the applied index, including for rejected
    /// commands: the rejection is part of the replicated history.
    #[test]
    fn apply_advances_index_on_rejection() {
        let mut state = State::new(Config::default());
        let entry = |index, command: &Command| raft::Entry {
            index,
            term: 1,
            command: command.encode().expect("encode failed"),
        };

        let create = Command::NewUser {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        let output = state.apply(entry(1, &create)).expect("apply failed");
        assert_eq!(
            Output::decode(&output).expect("decode failed"),
            Output::UserCreated { username: "alice".to_string() }
        );
        assert_eq!(state.get_applied_index(), 1);

        // The duplicate is rejected, but the entry still applies.
        let result = state.apply(entry(2, &create));
        assert_eq!(result, Err(Error::InvalidInput("user alice already exists".to_string())));
        assert_eq!(state.get_applied_index(), 2);
    }

    #[test]
    fn command_roundtrip() {
        let command = Command::NewAuction {
            user: "alice".to_string(),
            start_date: 1_700_000_000_000,
            obj_name: "teapot".to_string(),
            obj_desc: "slightly chipped".to_string(),
            start_price: 100,
        };
        let bytes = command.encode().expect("encode failed");
        assert_eq!(Command::decode(&bytes).expect("decode failed"), command);
    }
}
